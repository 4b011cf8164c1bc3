//! Jobs: one caller request from submission until it settles.
//!
//! A [`Job`] owns the sender half of its result channel. Settling consumes
//! the job, and dropping an unsettled job rejects it, so every path that
//! removes a job from tracking settles its caller exactly once.

use std::time::Instant;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, JobError};
use crate::estimator::FallbackEstimator;
use crate::pool::dedup::Fingerprint;
use crate::protocol::{PoolMessage, RequestId};

/// Job identifier; doubles as the protocol request id.
pub type JobId = RequestId;

/// Options for [`WorkerPool::submit`](crate::pool::WorkerPool::submit).
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Lower values are more urgent.
    pub priority: i32,
    /// Cancels the request when triggered.
    pub cancel: Option<CancellationToken>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Unit of work carried by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Count(String),
    Batch(Vec<String>),
}

impl JobPayload {
    /// Total payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Count(text) => text.len(),
            Self::Batch(texts) => texts.iter().map(String::len).sum(),
        }
    }

    pub(crate) fn to_message(&self, id: JobId) -> PoolMessage {
        match self {
            Self::Count(text) => PoolMessage::Count {
                id,
                payload: text.clone(),
            },
            Self::Batch(texts) => PoolMessage::BatchCount {
                id,
                payload: texts.clone(),
            },
        }
    }

    pub(crate) fn estimate(&self, estimator: &dyn FallbackEstimator) -> JobOutput {
        match self {
            Self::Count(text) => JobOutput::Count(estimator.estimate(text)),
            Self::Batch(texts) => {
                JobOutput::Batch(texts.iter().map(|t| estimator.estimate(t)).collect())
            }
        }
    }
}

/// Settled value of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Count(usize),
    Batch(Vec<usize>),
}

impl JobOutput {
    /// Sum of all counts.
    pub fn total(self) -> usize {
        match self {
            Self::Count(n) => n,
            Self::Batch(counts) => counts.into_iter().sum(),
        }
    }

    /// Per-text counts, in input order.
    pub fn into_counts(self) -> Vec<usize> {
        match self {
            Self::Count(n) => vec![n],
            Self::Batch(counts) => counts,
        }
    }
}

pub(crate) type JobResult = Result<JobOutput, JobError>;

/// A caller request tracked by the pool.
pub(crate) struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: i32,
    pub fingerprint: Option<Fingerprint>,
    pub submitted_at: Instant,
    cancel: Option<CancellationToken>,
    controller: CancellationToken,
    reply: Option<oneshot::Sender<JobResult>>,
}

impl Job {
    pub fn new(
        id: JobId,
        payload: JobPayload,
        options: &SubmitOptions,
        fingerprint: Option<Fingerprint>,
        reply: oneshot::Sender<JobResult>,
    ) -> Self {
        Self {
            id,
            payload,
            priority: options.priority,
            fingerprint,
            submitted_at: Instant::now(),
            cancel: options.cancel.clone(),
            controller: CancellationToken::new(),
            reply: Some(reply),
        }
    }

    /// Has the caller's token fired?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Internal controller, cancelled when the job settles. Timer and
    /// cancellation-watcher tasks exit on it.
    pub fn controller(&self) -> CancellationToken {
        self.controller.clone()
    }

    /// Deliver the result to the caller.
    pub fn settle(mut self, result: JobResult) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(JobError::cancelled(self.id, CancelReason::Dropped)));
        }
        self.controller.cancel();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("payload_bytes", &self.payload.size_bytes())
            .field("settled", &self.reply.is_none())
            .finish()
    }
}

/// A job dispatched to a worker.
#[derive(Debug)]
pub(crate) struct ActiveJob {
    pub job: Job,
    pub worker_id: usize,
    pub generation: u64,
    pub started_at: Instant,
    pub payload_size: usize,
}
