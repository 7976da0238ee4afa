//! Best-effort broadcast event bus for task/phase/iteration observers.
//!
//! Every state change, phase transition, iteration boundary, and transcript
//! line is published here. A slow subscriber is never allowed to stall the
//! engine: `tokio::sync::broadcast` drops the oldest buffered message for a
//! lagging receiver rather than blocking the sender.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::PhaseName;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub task_id: String,
    #[serde(default)]
    pub phase: Option<PhaseName>,
    #[serde(default)]
    pub iteration: Option<u32>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TaskStateChanged { from: String, to: String },
    PhaseStarted,
    PhaseEnded { outcome: String },
    IterationStarted,
    TranscriptLine { text: String },
    GateDecided { approved: bool, feedback: Option<String> },
    ExecutionOrphaned { reason: String },
}

/// Broadcast bus. Cloning is cheap; every clone shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Best-effort: if there are no subscribers, or a
    /// subscriber's buffer is full, the event is simply dropped for them.
    pub fn publish(&self, task_id: impl Into<String>, phase: Option<PhaseName>, iteration: Option<u32>, payload: EventPayload) {
        let event = Event {
            ts: Utc::now(),
            task_id: task_id.into(),
            phase,
            iteration,
            payload,
        };
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
