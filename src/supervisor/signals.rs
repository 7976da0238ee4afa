//! Extracts structured signals embedded in agent stdout.
//!
//! Recognizes the tag vocabulary a phase's agent invocation is expected to
//! emit (`<phase_complete>true|false</phase_complete>`,
//! `<needs_clarification>`, `<progress>`, `<blocker>`, `<pivot>`) plus
//! `<cost tokens="N"/>`-style telemetry lines, so the supervisor can track
//! cost without waiting for the process to exit.

use regex::Regex;
use std::sync::LazyLock;

use crate::model::TokenUsage;

static PROGRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<progress>\s*(\d{1,3})%?\s*</progress>").unwrap());
static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<blocker>(.*?)</blocker>").unwrap());
static PIVOT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<pivot>(.*?)</pivot>").unwrap());
static NEEDS_CLARIFICATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<needs_clarification>(.*?)</needs_clarification>").unwrap());
static PHASE_COMPLETE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<phase_complete>\s*(true|false)\s*</phase_complete>").unwrap());
static COST_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"<cost\s+tokens="(\d+)"\s*/>"#).unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSignal {
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockerSignal {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PivotSignal {
    pub new_approach: String,
}

/// Everything recognized across one turn's worth of stdout lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationSignals {
    pub progress: Vec<ProgressSignal>,
    pub blockers: Vec<BlockerSignal>,
    pub pivots: Vec<PivotSignal>,
    pub needs_clarification: Option<String>,
    pub phase_complete: bool,
    pub tokens: TokenUsage,
}

impl IterationSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_signals(&self) -> bool {
        !self.progress.is_empty()
            || !self.blockers.is_empty()
            || !self.pivots.is_empty()
            || self.needs_clarification.is_some()
            || self.phase_complete
    }

    pub fn merge_line(&mut self, text: &str) {
        for cap in PROGRESS_REGEX.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                if let Ok(pct) = m.as_str().parse::<u16>() {
                    self.progress.push(ProgressSignal {
                        percentage: pct.min(100) as u8,
                    });
                }
            }
        }

        for cap in BLOCKER_REGEX.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                let description = m.as_str().trim();
                if !description.is_empty() {
                    self.blockers.push(BlockerSignal {
                        description: description.to_string(),
                    });
                }
            }
        }

        for cap in PIVOT_REGEX.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                let new_approach = m.as_str().trim();
                if !new_approach.is_empty() {
                    self.pivots.push(PivotSignal {
                        new_approach: new_approach.to_string(),
                    });
                }
            }
        }

        if let Some(cap) = NEEDS_CLARIFICATION_REGEX.captures(text) {
            if let Some(m) = cap.get(1) {
                let question = m.as_str().trim();
                if !question.is_empty() {
                    self.needs_clarification = Some(question.to_string());
                }
            }
        }

        if let Some(cap) = PHASE_COMPLETE_REGEX.captures(text) {
            self.phase_complete = cap.get(1).map(|m| m.as_str() == "true").unwrap_or(false);
        }

        for cap in COST_REGEX.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                if let Ok(tokens) = m.as_str().parse::<u64>() {
                    self.tokens += TokenUsage { total_tokens: tokens };
                }
            }
        }
    }
}
