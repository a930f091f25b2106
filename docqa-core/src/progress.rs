//! Progress events for a pipeline run.
//!
//! The orchestrator reports every stage entry and exit through a
//! [`ProgressSink`]. Emission is synchronous and must not block; sink errors
//! are logged and otherwise ignored so a slow or closed consumer can never
//! fail a run.

use crate::error::ProgressError;
use crate::run::RunStatus;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle status carried by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Completed,
    /// Completed, but a redundant sub-call failed.
    Degraded,
    Failed,
    /// Terminal event of the run.
    Finished,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressStatus::Started => write!(f, "started"),
            ProgressStatus::Completed => write!(f, "completed"),
            ProgressStatus::Degraded => write!(f, "degraded"),
            ProgressStatus::Failed => write!(f, "failed"),
            ProgressStatus::Finished => write!(f, "finished"),
        }
    }
}

/// One observable step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub stage: String,
    pub status: ProgressStatus,
    pub message: String,
    /// Cumulative fraction of planned work, in [0, 1].
    pub progress: f64,
    pub cost_so_far: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Set only on the `Finished` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunStatus>,
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent) -> Result<(), ProgressError>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) -> Result<(), ProgressError> {
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        self.tx.send(event).map_err(|_| ProgressError::Closed)
    }
}

/// Keeps every event in memory. Used by tests and for run replays.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        self.events
            .lock()
            .map_err(|e| ProgressError::Sink(e.to_string()))?
            .push(event);
        Ok(())
    }
}

/// Run-scoped emitter: stamps the run id, tracks progress and goes silent
/// once the run is cancelled.
pub struct ProgressEmitter {
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    run_id: Uuid,
    planned_steps: usize,
    completed_steps: usize,
}

impl ProgressEmitter {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        run_id: Uuid,
        planned_steps: usize,
    ) -> Self {
        Self {
            sink,
            cancel,
            run_id,
            planned_steps: planned_steps.max(1),
            completed_steps: 0,
        }
    }

    /// Fraction of planned steps finished so far.
    pub fn progress(&self) -> f64 {
        (self.completed_steps as f64 / self.planned_steps as f64).min(1.0)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stage_started(&self, stage: &str, message: impl Into<String>, cost_so_far: f64) {
        self.send(stage, ProgressStatus::Started, message.into(), cost_so_far, None, None);
    }

    /// Report a stage exit. Completed, degraded and failed exits all advance progress.
    pub fn stage_finished(
        &mut self,
        stage: &str,
        status: ProgressStatus,
        message: impl Into<String>,
        cost_so_far: f64,
        duration_ms: u64,
    ) {
        self.completed_steps += 1;
        self.send(stage, status, message.into(), cost_so_far, Some(duration_ms), None);
    }

    /// Terminal event; progress is reported as complete.
    pub fn finished(&mut self, outcome: RunStatus, message: impl Into<String>, cost: f64, duration_ms: u64) {
        self.completed_steps = self.planned_steps;
        self.send(
            "pipeline",
            ProgressStatus::Finished,
            message.into(),
            cost,
            Some(duration_ms),
            Some(outcome),
        );
    }

    fn send(
        &self,
        stage: &str,
        status: ProgressStatus,
        message: String,
        cost_so_far: f64,
        duration_ms: Option<u64>,
        outcome: Option<RunStatus>,
    ) {
        if self.cancel.is_cancelled() {
            return;
        }
        let event = ProgressEvent {
            run_id: self.run_id,
            stage: stage.to_string(),
            status,
            message,
            progress: self.progress(),
            cost_so_far,
            duration_ms,
            outcome,
        };
        if let Err(e) = self.sink.emit(event) {
            tracing::warn!(run_id = %self.run_id, stage, error = %e, "Progress event dropped");
        }
    }
}

impl std::fmt::Debug for ProgressEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressEmitter")
            .field("run_id", &self.run_id)
            .field("planned_steps", &self.planned_steps)
            .field("completed_steps", &self.completed_steps)
            .finish()
    }
}
