//! Phase gate evaluation.
//!
//! A gate decides whether a phase's output is admitted before the task
//! moves on. Unlike a single-operator CLI, this engine runs many tasks
//! concurrently, so a gate can never block a thread waiting on a terminal
//! prompt: `Human` gates resolve to [`GateOutcome::Pending`] and the task
//! simply sits in `blocked` until an operator calls back in through
//! [`crate::scheduler`]'s `resolve` command.

use async_trait::async_trait;
use std::sync::Arc;

use crate::model::{FileChangeSummary, GateType, PhaseName};
use crate::supervisor::signals::IterationSignals;

/// Everything a gate needs to judge a phase's output.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub phase: PhaseName,
    pub changes: FileChangeSummary,
    pub signals: IterationSignals,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Approved { feedback: Option<String> },
    Rejected { feedback: String },
    /// Awaiting an external decision; the task is parked, not failed.
    Pending,
}

impl GateOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateOutcome::Approved { .. })
    }
}

/// A pluggable reviewer for `Ai` gates: typically a supervisor turn against
/// the agent in review mode, but swappable for tests.
#[async_trait]
pub trait AiGate: Send + Sync {
    async fn review(&self, ctx: &GateContext) -> anyhow::Result<GateOutcome>;
}

pub struct GateEvaluator {
    ai_gate: Option<Arc<dyn AiGate>>,
    auto_approve_on_success: bool,
}

impl GateEvaluator {
    pub fn new(ai_gate: Option<Arc<dyn AiGate>>, auto_approve_on_success: bool) -> Self {
        Self {
            ai_gate,
            auto_approve_on_success,
        }
    }

    pub async fn evaluate(&self, gate: GateType, ctx: &GateContext) -> anyhow::Result<GateOutcome> {
        match gate {
            GateType::None => Ok(GateOutcome::Approved { feedback: None }),
            GateType::Auto => Ok(self.evaluate_auto(ctx)),
            GateType::Human => Ok(GateOutcome::Pending),
            GateType::Ai => match &self.ai_gate {
                Some(reviewer) => reviewer.review(ctx).await,
                // No reviewer wired up: fall back to the automatic check
                // rather than silently blocking every Ai-gated task.
                None => Ok(self.evaluate_auto(ctx)),
            },
        }
    }

    /// When `auto_approve_on_success` is set, approve unconditionally.
    /// Otherwise approve unless the turn surfaced blockers.
    fn evaluate_auto(&self, ctx: &GateContext) -> GateOutcome {
        if self.auto_approve_on_success {
            return GateOutcome::Approved { feedback: None };
        }
        if !ctx.signals.blockers.is_empty() {
            let feedback = ctx
                .signals
                .blockers
                .iter()
                .map(|b| b.description.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return GateOutcome::Rejected { feedback };
        }
        GateOutcome::Approved { feedback: None }
    }
}
