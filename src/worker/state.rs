//! Worker lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::protocol::RequestId;

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, waiting for WORKER_READY.
    Spawned,
    /// Alive, INIT sent, waiting for INIT_COMPLETE.
    Ready,
    /// Accepted INIT; eligible for dispatch.
    Initialized,
    /// Crashed, unhealthy, or rejected INIT. Awaiting recovery or recycling.
    Failed,
    /// Retired after too many crashes. Never dispatched to again.
    Retired,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // Handshake
            (Spawned, Ready) | (Ready, Initialized) |
            // Failure from any live state
            (Spawned, Failed) | (Ready, Failed) | (Initialized, Failed) |
            // Respawn
            (Failed, Spawned) |
            // Retirement
            (Spawned, Retired) | (Ready, Retired) | (Initialized, Retired) | (Failed, Retired)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Retired)
    }

    /// Has the worker sent WORKER_READY in its current incarnation?
    pub fn has_reported_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Initialized)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawned => "spawned",
            Self::Ready => "ready",
            Self::Initialized => "initialized",
            Self::Failed => "failed",
            Self::Retired => "retired",
        };
        write!(f, "{s}")
    }
}

/// Pool-side bookkeeping for one worker slot.
///
/// `generation` changes every time the slot gets a new worker, so events
/// and timers that captured an older generation can be recognized as stale.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    /// Slot index.
    pub id: usize,
    /// Incarnation of the worker occupying this slot.
    pub generation: u64,
    /// Current state.
    pub state: WorkerState,
    /// Job currently dispatched to this worker.
    pub active_job: Option<RequestId>,
    /// Outstanding INIT request.
    pub init_request: Option<RequestId>,
    /// Jobs answered by this slot across incarnations.
    pub jobs_completed: u64,
    /// Number of respawns.
    pub restarts: u32,
    /// When the current state was entered.
    pub state_since: DateTime<Utc>,
}

impl WorkerRecord {
    /// Create a record for a freshly spawned worker.
    pub fn new(id: usize, generation: u64) -> Self {
        Self {
            id,
            generation,
            state: WorkerState::Spawned,
            active_job: None,
            init_request: None,
            jobs_completed: 0,
            restarts: 0,
            state_since: Utc::now(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, next: WorkerState) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                id: self.id,
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.state_since = Utc::now();
        if matches!(next, WorkerState::Failed | WorkerState::Retired) {
            self.init_request = None;
        }
        Ok(())
    }

    /// Reset the slot for a replacement worker.
    pub fn respawn(&mut self, generation: u64) -> Result<(), WorkerError> {
        self.transition_to(WorkerState::Spawned)?;
        self.generation = generation;
        self.active_job = None;
        self.init_request = None;
        self.restarts += 1;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state.has_reported_ready()
    }

    pub fn is_initialized(&self) -> bool {
        self.state == WorkerState::Initialized
    }

    pub fn is_busy(&self) -> bool {
        self.active_job.is_some()
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Ready, initialized, idle, and not retired.
    pub fn is_available(&self) -> bool {
        self.is_initialized() && !self.is_busy()
    }
}
