//! Crash recovery: per-worker serialization and failure-rate retirement.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::WorkerError;
use crate::pool::scheduler::{PoolInner, PoolState};
use crate::worker::handle::WorkerHandle;
use crate::worker::WorkerState;

/// Crash timestamps inside a sliding window.
#[derive(Debug)]
pub(crate) struct FailureWindow {
    window: Duration,
    crashes: VecDeque<Instant>,
}

impl FailureWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash at `now` and return the number of crashes still inside
    /// the window.
    pub fn record(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.crashes.push_back(now);
        self.crashes.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.crashes.front() {
            if now.saturating_duration_since(oldest) <= self.window {
                break;
            }
            self.crashes.pop_front();
        }
    }
}

/// What a recovery attempt ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A replacement worker completed the handshake.
    Recovered,
    /// The worker crashed too often and was retired.
    Retired,
    /// Another recovery (or a recycle) already replaced this incarnation.
    AlreadyHandled,
    /// The pool is terminated or recycling.
    Skipped,
}

enum Step {
    Stop(RecoveryOutcome, Option<WorkerHandle>),
    Respawn { generation: u64, old: Option<WorkerHandle> },
}

impl PoolInner {
    pub(crate) fn spawn_recovery(&self, worker_id: usize, generation: u64) {
        let pool = self.weak.clone();
        tokio::spawn(async move {
            if let Some(pool) = pool.upgrade() {
                let outcome = pool.recover_worker(worker_id, generation).await;
                tracing::debug!(worker_id, ?outcome, "Recovery finished");
            }
        });
    }

    /// Replace a failed worker, retrying with backoff until it either
    /// completes the handshake or exceeds the failure threshold.
    ///
    /// Serialized per worker: a concurrent call waits for the one in flight
    /// and then finds its generation already replaced.
    pub(crate) async fn recover_worker(&self, worker_id: usize, observed_generation: u64) -> RecoveryOutcome {
        let Some(lock) = self.recovery_locks.get(worker_id).cloned() else {
            return RecoveryOutcome::Skipped;
        };
        let _guard = lock.lock().await;
        let mut generation = observed_generation;

        loop {
            let step = self.begin_recovery(worker_id, generation);
            let (new_generation, old) = match step {
                Step::Stop(outcome, handle) => {
                    if let Some(handle) = handle {
                        handle.shutdown();
                    }
                    self.notify();
                    return outcome;
                }
                Step::Respawn { generation, old } => (generation, old),
            };
            if let Some(old) = old {
                old.shutdown();
            }
            generation = new_generation;
            tracing::info!(worker_id, generation, "Respawning worker");

            let attached = match self.spawner.spawn(worker_id) {
                Ok(connection) => {
                    let mut state = self.state.lock();
                    if state.terminated || state.worker_state(worker_id, generation).is_none() {
                        connection.close();
                        return RecoveryOutcome::AlreadyHandled;
                    }
                    self.attach(&mut state, worker_id, connection);
                    true
                }
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Respawn failed");
                    false
                }
            };

            let handshake = if attached {
                self.await_handshake(worker_id, generation).await
            } else {
                Err(WorkerError::Disconnected { id: worker_id })
            };

            match handshake {
                Ok(()) => {
                    self.state.lock().metrics.recoveries += 1;
                    tracing::info!(worker_id, generation, "Worker recovered");
                    self.notify();
                    return RecoveryOutcome::Recovered;
                }
                Err(e) => {
                    tracing::warn!(worker_id, generation, error = %e, "Replacement worker failed handshake");
                    self.fail_worker(&mut self.state.lock(), worker_id, generation, "handshake failed");
                    self.notify();
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return RecoveryOutcome::Skipped,
                _ = tokio::time::sleep(self.config.recovery_backoff) => {}
            }
        }
    }

    /// Record the failure and decide between retirement and respawn.
    fn begin_recovery(&self, worker_id: usize, generation: u64) -> Step {
        let mut state = self.state.lock();
        if state.terminated || state.recycling {
            return Step::Stop(RecoveryOutcome::Skipped, None);
        }
        let max_failures = self.config.max_failures_in_window;
        let next_generation = state.next_generation();

        let Some(slot) = state.slot_mut(worker_id, generation) else {
            return Step::Stop(RecoveryOutcome::AlreadyHandled, None);
        };
        if slot.record.state != WorkerState::Failed {
            return Step::Stop(RecoveryOutcome::AlreadyHandled, None);
        }

        let failures = slot.failures.record(Instant::now());
        if failures >= max_failures {
            let _ = slot.record.transition_to(WorkerState::Retired);
            let handle = slot.handle.take();
            tracing::warn!(worker_id, failures, "Worker crashed too often; retiring it");
            state.metrics.retired += 1;
            self.check_total_failure(&mut state);
            return Step::Stop(RecoveryOutcome::Retired, handle);
        }

        if let Err(e) = slot.record.respawn(next_generation) {
            tracing::warn!(worker_id, error = %e, "Cannot respawn worker");
            return Step::Stop(RecoveryOutcome::AlreadyHandled, None);
        }
        Step::Respawn {
            generation: next_generation,
            old: slot.handle.take(),
        }
    }

    /// Enter total degradation once every worker is retired.
    fn check_total_failure(&self, state: &mut PoolState) {
        if state.slots.is_empty() || !state.slots.iter().all(|s| s.record.is_permanently_failed()) {
            return;
        }
        state.accepting_jobs = false;
        let drained = self.drain_queue_with_fallback(state);
        tracing::error!(
            workers = state.slots.len(),
            drained,
            "All workers permanently failed; serving fallback estimates only"
        );
    }
}
