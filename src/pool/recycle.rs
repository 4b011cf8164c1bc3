//! Soft restart of the whole pool under memory pressure, on idle, or on
//! demand.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::pool::lifecycle::InitReport;
use crate::pool::scheduler::PoolInner;
use crate::worker::WorkerState;

/// What asked for the recycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecycleTrigger {
    Manual,
    MemoryPressure,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleOutcome {
    /// This call reinitialized the pool.
    Recycled(InitReport),
    /// Another recycle ran while this call waited; the pool is already fresh.
    Coalesced,
    /// The pool is terminated.
    Skipped,
}

/// Restores admission when a recycle ends, however it ends.
struct RecyclingGuard<'a> {
    pool: &'a PoolInner,
}

impl Drop for RecyclingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.recycling = false;
        state.recycle_epoch += 1;
        state.accepting_jobs = !state.terminated && state.slots.iter().any(|s| s.record.is_initialized());
        if !state.terminated {
            // Recovery is suspended while recycling; pick up workers that
            // failed in the meantime.
            for slot in &state.slots {
                if slot.record.state == WorkerState::Failed {
                    self.pool.spawn_recovery(slot.record.id, slot.record.generation);
                }
            }
        }
        self.pool.pump(&mut state);
        drop(state);
        self.pool.notify();
    }
}

impl PoolInner {
    /// Drain, tear down and reinitialize every worker.
    ///
    /// Serialized by the pool-wide recycle lock. A caller that had to wait
    /// for another recycle returns [`RecycleOutcome::Coalesced`] instead of
    /// restarting the pool a second time.
    pub(crate) async fn recycle(&self, trigger: RecycleTrigger) -> RecycleOutcome {
        let epoch = self.state.lock().recycle_epoch;
        let _lock = self.recycle_lock.lock().await;

        {
            let mut state = self.state.lock();
            if state.terminated {
                return RecycleOutcome::Skipped;
            }
            if state.recycle_epoch != epoch {
                return RecycleOutcome::Coalesced;
            }
            state.accepting_jobs = false;
            state.recycling = true;
            let drained = self.drain_queue_with_fallback(&mut state);
            tracing::info!(?trigger, drained, active = state.active.len(), "Recycling worker pool");
        }
        let _guard = RecyclingGuard { pool: self };
        self.notify();

        self.wait_for_active_drain().await;

        let handles = {
            let mut state = self.state.lock();
            let stuck: Vec<_> = state.active.drain().map(|(_, active)| active).collect();
            if !stuck.is_empty() {
                tracing::warn!(stuck = stuck.len(), "Force-resolving jobs stuck across recycle");
            }
            for active in stuck {
                state
                    .metrics
                    .record_processed(active.started_at.elapsed(), false);
                self.settle_with_fallback(&mut state, active.job);
            }
            state
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.record.active_job = None;
                    slot.handle.take()
                })
                .collect::<Vec<_>>()
        };
        for handle in handles {
            handle.shutdown();
        }

        if self.shutdown.is_cancelled() {
            return RecycleOutcome::Skipped;
        }
        let report = self.initialize_workers().await;

        {
            let mut state = self.state.lock();
            state.metrics.recycles += 1;
            state.metrics.last_recycle = Some(Utc::now());
            state.jobs_since_recycle = 0;
        }
        RecycleOutcome::Recycled(report)
    }

    /// Poll until no job is active, the active count stops changing for
    /// `drain_stable_checks` polls, or the drain ceiling passes.
    async fn wait_for_active_drain(&self) {
        let settings = &self.config.recycle;
        let deadline = Instant::now() + settings.drain_ceiling;
        let mut last = None;
        let mut stable = 0u32;

        loop {
            let active = self.state.lock().active.len();
            if active == 0 {
                return;
            }
            if last == Some(active) {
                stable += 1;
                if stable >= settings.drain_stable_checks {
                    tracing::debug!(active, "Active jobs stopped draining");
                    return;
                }
            } else {
                last = Some(active);
                stable = 0;
            }
            if Instant::now() >= deadline {
                tracing::warn!(active, "Drain ceiling reached");
                return;
            }
            tokio::time::sleep(settings.drain_poll_interval).await;
        }
    }

    /// Recycle if reported usage crosses the configured threshold.
    pub(crate) async fn on_memory_usage(&self, bytes: u64) -> Option<RecycleOutcome> {
        let threshold = self.config.recycle.memory_threshold_bytes?;
        if bytes < threshold {
            return None;
        }
        tracing::warn!(bytes, threshold, "Memory threshold exceeded");
        Some(self.recycle(RecycleTrigger::MemoryPressure).await)
    }

    /// Recycle a pool that has done work but has been quiet for
    /// `recycle.idle_after`.
    pub(crate) async fn recycle_if_idle(&self) -> Option<RecycleOutcome> {
        let idle_after = self.config.recycle.idle_after?;
        let due = {
            let state = self.state.lock();
            !state.terminated
                && !state.recycling
                && state.jobs_since_recycle > 0
                && state.queue.is_empty()
                && state.active.is_empty()
                && state.last_activity.elapsed() >= idle_after
        };
        if !due {
            return None;
        }
        Some(self.recycle(RecycleTrigger::Idle).await)
    }
}
