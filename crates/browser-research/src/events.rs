//! Orchestrator event bus: typed progress events for a plan run.
//!
//! The bus is a `tokio::sync::broadcast` channel carrying
//! [`OrchestratorEvent`] values. The CLI logs them; tests subscribe to
//! assert on admission order and retry delays. With no subscribers,
//! events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event the scheduler emits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorEvent {
    // ── Plan Events ───────────────────────
    PlanStarted { query: String, tasks: usize },
    /// The plan was cancelled or hit its deadline.
    PlanCancelled { reason: String, unfinished: usize },
    PlanComplete {
        succeeded: usize,
        failed: usize,
        denied: usize,
        cancelled: usize,
        elapsed_ms: u64,
    },

    // ── Task Events ───────────────────────
    /// The task took a worker slot for its next attempt.
    TaskAdmitted {
        task_id: String,
        origin: String,
        attempt: u32,
    },
    TaskDenied { task_id: String, reason: String },
    CacheHit { task_id: String },
    /// A transient failure will be retried after `delay_ms`.
    RetryScheduled {
        task_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskSucceeded {
        task_id: String,
        documents: usize,
        attempts: u32,
    },
    TaskFailed {
        task_id: String,
        error: String,
        attempts: u32,
    },
}

impl OrchestratorEvent {
    /// Task the event belongs to, `None` for plan-level events.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskAdmitted { task_id, .. }
            | Self::TaskDenied { task_id, .. }
            | Self::CacheHit { task_id }
            | Self::RetryScheduled { task_id, .. }
            | Self::TaskSucceeded { task_id, .. }
            | Self::TaskFailed { task_id, .. } => Some(task_id),
            Self::PlanStarted { .. } | Self::PlanCancelled { .. } | Self::PlanComplete { .. } => {
                None
            }
        }
    }
}

/// Broadcast bus shared by the scheduler and its observers.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all subscribers. Ignored when nobody listens.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
