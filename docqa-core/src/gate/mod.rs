//! Quality gate: decides whether an answer is accepted or regenerated.
//!
//! The gate is an explicit state machine driven by a pure transition
//! function, so every decision can be tested without I/O:
//!
//! ```text
//! Evaluating{n} --pass--------------------------> Accepted
//! Evaluating{n} --fail, n < max-----------------> Iterating{n+1, feedback}
//! Iterating{n+1} --begin_next-------------------> Evaluating{n+1}
//! Evaluating{n} --fail, n = max-----------------> Exhausted{best}
//! ```
//!
//! Accuracy and quality must both pass.

pub mod feedback;

pub use feedback::format_feedback;

use crate::config::GateConfig;
use crate::run::IterationEvaluation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Why an answer was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptReason {
    ThresholdsMet,
    /// First iteration cleared the early-exit threshold.
    Excellent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateState {
    /// Waiting for the scores of `iteration`.
    Evaluating { iteration: u32 },
    /// Another generation is due, guided by `feedback`.
    Iterating { next: u32, feedback: String },
    Accepted { iteration: u32, reason: AcceptReason },
    /// Budget spent; `best_iteration` is returned below threshold.
    Exhausted { best_iteration: u32 },
}

impl GateState {
    pub fn start() -> Self {
        GateState::Evaluating { iteration: 1 }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Accepted { .. } | GateState::Exhausted { .. })
    }

    /// Short name for logs and stage metadata.
    pub fn name(&self) -> &'static str {
        match self {
            GateState::Evaluating { .. } => "evaluating",
            GateState::Iterating { .. } => "iterating",
            GateState::Accepted { .. } => "accepted",
            GateState::Exhausted { .. } => "exhausted",
        }
    }

    /// Feed the scores of the current iteration.
    ///
    /// `history` holds every scored iteration so far, the current one last.
    /// Only `Evaluating` reacts; other states are returned unchanged.
    pub fn observe(self, config: &GateConfig, history: &[IterationEvaluation]) -> GateState {
        let GateState::Evaluating { iteration } = self else {
            return self;
        };
        let Some(current) = history.last() else {
            return self;
        };

        let quality = current.average_score.unwrap_or(0.0);
        let accuracy = current.accuracy.as_ref().map(|a| a.score).unwrap_or(0.0);
        let accuracy_passes = accuracy >= config.accuracy_threshold;
        let quality_passes = quality >= config.quality_threshold;

        // the early exit never accepts below either threshold
        if iteration == 1
            && accuracy_passes
            && quality_passes
            && config.excellent_threshold.is_some_and(|t| quality >= t)
        {
            return GateState::Accepted {
                iteration,
                reason: AcceptReason::Excellent,
            };
        }
        if accuracy_passes && quality_passes {
            return GateState::Accepted {
                iteration,
                reason: AcceptReason::ThresholdsMet,
            };
        }
        if iteration < config.max_iterations {
            return GateState::Iterating {
                next: iteration + 1,
                feedback: format_feedback(config, current),
            };
        }
        GateState::Exhausted {
            best_iteration: best_iteration(history).map(|e| e.iteration).unwrap_or(iteration),
        }
    }

    /// Enter the next evaluation after a regeneration.
    pub fn begin_next(self) -> GateState {
        match self {
            GateState::Iterating { next, .. } => GateState::Evaluating { iteration: next },
            other => other,
        }
    }

    /// Human summary of the state for logs and stage metadata.
    pub fn reason(&self, config: &GateConfig, current: &IterationEvaluation) -> String {
        let quality = current.average_score.unwrap_or(0.0);
        let accuracy = current.accuracy.as_ref().map(|a| a.score).unwrap_or(0.0);
        match self {
            GateState::Accepted {
                reason: AcceptReason::Excellent,
                ..
            } => format!(
                "Quality score {quality:.1} is excellent (>= {:.0}) on the first iteration",
                config.excellent_threshold.unwrap_or(config.quality_threshold)
            ),
            GateState::Accepted { .. } => format!(
                "Quality score {quality:.1} and accuracy {accuracy:.0} meet thresholds"
            ),
            GateState::Iterating { .. } | GateState::Evaluating { .. } => {
                failing_reason(config, quality, accuracy)
            }
            GateState::Exhausted { best_iteration } => format!(
                "Maximum iterations ({}) reached; returning iteration {best_iteration}. {}",
                config.max_iterations,
                failing_reason(config, quality, accuracy)
            ),
        }
    }
}

fn failing_reason(config: &GateConfig, quality: f64, accuracy: f64) -> String {
    let mut reasons = Vec::new();
    if quality < config.quality_threshold {
        reasons.push(format!(
            "quality score {quality:.1} below threshold {:.0}",
            config.quality_threshold
        ));
    }
    if accuracy < config.accuracy_threshold {
        reasons.push(format!(
            "accuracy score {accuracy:.0} below threshold {:.0}",
            config.accuracy_threshold
        ));
    }
    let mut text = reasons.join("; ");
    if let Some(first) = text.get(..1) {
        text = first.to_uppercase() + &text[1..];
    }
    text
}

/// Highest average score wins; the earliest iteration wins a tie.
pub fn best_iteration(history: &[IterationEvaluation]) -> Option<&IterationEvaluation> {
    history
        .iter()
        .filter(|e| e.average_score.is_some())
        .fold(None, |best: Option<&IterationEvaluation>, candidate| match best {
            Some(current)
                if candidate
                    .average_score
                    .partial_cmp(&current.average_score)
                    .unwrap_or(Ordering::Equal)
                    != Ordering::Greater =>
            {
                Some(current)
            }
            _ => Some(candidate),
        })
}
