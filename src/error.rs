//! Error types for the token pool.

use std::time::Duration;

use crate::protocol::RequestId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {key}={value:?}: {reason}")]
    ParseError {
        key: String,
        value: String,
        reason: String,
    },
}

/// Which part of the startup handshake a worker failed to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Ready,
    Init,
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "WORKER_READY"),
            Self::Init => write!(f, "INIT_COMPLETE"),
        }
    }
}

/// Worker lifecycle errors. These stay inside the pool; callers of
/// `submit` never see them.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {id} failed to spawn: {reason}")]
    SpawnFailed { id: usize, reason: String },

    #[error("Worker {id} did not send {phase} within {timeout:?}")]
    HandshakeTimeout {
        id: usize,
        phase: HandshakePhase,
        timeout: Duration,
    },

    #[error("Worker {id} disconnected")]
    Disconnected { id: usize },

    #[error("Worker {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: usize, from: String, to: String },
}

/// Wire codec errors for process-backed workers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Caller,
    /// The pool was terminated while the job was pending.
    PoolTerminated,
    /// The job left tracking without being settled.
    Dropped,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Caller => "cancelled by caller",
            Self::PoolTerminated => "pool terminated",
            Self::Dropped => "job dropped",
        };
        write!(f, "{s}")
    }
}

/// Errors visible to callers of `submit`. Every other failure degrades to
/// the fallback estimate instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} {reason}")]
    Cancelled { id: RequestId, reason: CancelReason },
}

impl JobError {
    pub fn cancelled(id: RequestId, reason: CancelReason) -> Self {
        Self::Cancelled { id, reason }
    }

    /// Reason for the cancellation.
    pub fn reason(&self) -> CancelReason {
        match self {
            Self::Cancelled { reason, .. } => *reason,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
