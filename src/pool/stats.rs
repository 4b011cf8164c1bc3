//! Pool counters and the public stats snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pool::scheduler::PoolState;
use crate::worker::WorkerState;

/// Running counters, mutated under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
    pub submitted: u64,
    /// Dispatched jobs that reached a terminal state.
    pub processed: u64,
    /// Dispatched jobs answered with a worker result.
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    /// Jobs settled with the fallback estimator.
    pub fallbacks: u64,
    /// Worker results flagged as internally degraded.
    pub worker_fallbacks: u64,
    pub dropped: u64,
    pub dedup_hits: u64,
    pub recoveries: u64,
    pub retired: u64,
    pub recycles: u64,
    pub total_latency: Duration,
    pub last_recycle: Option<DateTime<Utc>>,
}

impl PoolMetrics {
    /// Record a dispatched job reaching a terminal state.
    pub fn record_processed(&mut self, latency: Duration, succeeded: bool) {
        self.processed += 1;
        self.total_latency += latency;
        if succeeded {
            self.succeeded += 1;
        }
    }
}

/// Coarse health of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Workers are still completing the handshake.
    Starting,
    /// Every worker is initialized.
    Ready,
    /// Some workers are initialized; the rest are failed, retired or recovering.
    Degraded,
    /// No usable worker; every request is served by the fallback estimator.
    Failed,
    Recycling,
    Terminated,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Recycling => "recycling",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub status: PoolStatus,
    pub submitted: u64,
    pub processed: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub queue_length: usize,
    pub active_jobs: usize,
    pub dropped_requests: u64,
    pub available_workers: usize,
    pub total_workers: usize,
    pub permanently_failed_workers: usize,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub fallbacks: u64,
    pub worker_fallbacks: u64,
    pub dedup_hits: u64,
    pub inflight_fingerprints: usize,
    pub recoveries: u64,
    pub recycles: u64,
    pub accepting_jobs: bool,
    pub last_recycled_at: Option<DateTime<Utc>>,
}

impl PoolState {
    pub(crate) fn status(&self) -> PoolStatus {
        if self.terminated {
            return PoolStatus::Terminated;
        }
        if self.recycling {
            return PoolStatus::Recycling;
        }
        let initialized = self.slots.iter().filter(|s| s.record.is_initialized()).count();
        if initialized > 0 {
            return if initialized == self.slots.len() {
                PoolStatus::Ready
            } else {
                PoolStatus::Degraded
            };
        }
        let handshaking = self
            .slots
            .iter()
            .any(|s| matches!(s.record.state, WorkerState::Spawned | WorkerState::Ready));
        if handshaking {
            PoolStatus::Starting
        } else {
            PoolStatus::Failed
        }
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        let m = &self.metrics;
        let (avg_latency_ms, success_rate) = if m.processed == 0 {
            (0.0, 1.0)
        } else {
            (
                m.total_latency.as_secs_f64() * 1000.0 / m.processed as f64,
                m.succeeded as f64 / m.processed as f64,
            )
        };

        PoolStats {
            status: self.status(),
            submitted: m.submitted,
            processed: m.processed,
            avg_latency_ms,
            success_rate,
            queue_length: self.queue.len(),
            active_jobs: self.active.len(),
            dropped_requests: m.dropped,
            available_workers: self
                .slots
                .iter()
                .filter(|s| !self.terminated && s.record.is_available())
                .count(),
            total_workers: self.slots.len(),
            permanently_failed_workers: self
                .slots
                .iter()
                .filter(|s| s.record.is_permanently_failed())
                .count(),
            failed: m.failed,
            timeouts: m.timeouts,
            cancelled: m.cancelled,
            fallbacks: m.fallbacks,
            worker_fallbacks: m.worker_fallbacks,
            dedup_hits: m.dedup_hits,
            inflight_fingerprints: self.dedup.len(),
            recoveries: m.recoveries,
            recycles: m.recycles,
            accepting_jobs: self.accepting_jobs,
            last_recycled_at: m.last_recycle,
        }
    }
}
