//! Pool ↔ worker message protocol.
//!
//! Every request carries an `id` that the matching response echoes back, so
//! responses are correlated by id, never by arrival order. For process-backed
//! workers the messages are JSON-serialized and newline-delimited.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Correlates a request with its response. Unique per pool.
pub type RequestId = u64;

/// Message from the pool to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolMessage {
    /// Run the worker's heavy initialization.
    Init { id: RequestId },

    /// Count tokens in a single text.
    Count { id: RequestId, payload: String },

    /// Count tokens in each text of a batch.
    BatchCount { id: RequestId, payload: Vec<String> },

    /// Liveness probe.
    HealthCheck { id: RequestId },

    /// Graceful shutdown request.
    Exit,
}

/// Message from a worker to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Worker is alive but not yet initialized.
    WorkerReady,

    /// Outcome of an `Init` request.
    InitComplete { id: RequestId, success: bool },

    /// Outcome of a `Count` request. `fallback` means the worker degraded
    /// internally.
    Result {
        id: RequestId,
        result: usize,
        #[serde(default)]
        fallback: bool,
    },

    /// Outcome of a `BatchCount` request, in input order.
    BatchResult {
        id: RequestId,
        result: Vec<usize>,
        #[serde(default)]
        fallback: bool,
    },

    /// The worker failed this job only.
    Error { id: RequestId, error: String },

    /// Answer to a `HealthCheck`.
    HealthResponse { id: RequestId, healthy: bool },
}

impl PoolMessage {
    /// Request id, if the message carries one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Init { id }
            | Self::Count { id, .. }
            | Self::BatchCount { id, .. }
            | Self::HealthCheck { id } => Some(*id),
            Self::Exit => None,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

impl WorkerMessage {
    /// Request id, if the message answers one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::WorkerReady => None,
            Self::InitComplete { id, .. }
            | Self::Result { id, .. }
            | Self::BatchResult { id, .. }
            | Self::Error { id, .. }
            | Self::HealthResponse { id, .. } => Some(*id),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}
