//! Periodic liveness probing.
//!
//! Each sweep sends `HEALTH_CHECK` to every idle initialized worker and
//! waits up to `health_check_timeout` for the answers. Workers that answer
//! unhealthy or not at all go through the crash path, which hands them to
//! recovery; recoveries for different workers run in parallel.
//!
//! Workers that have not finished the READY/INIT handshake are not probed.
//! The handshake deadline armed at spawn (and recovery's own handshake
//! timeouts) fail them instead, so a worker stuck in `Ready` is replaced
//! rather than left out of rotation.

use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pool::scheduler::PoolInner;
use crate::protocol::PoolMessage;

/// Result of one health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub probed: usize,
    pub healthy: usize,
    /// Workers handed to recovery.
    pub unhealthy: Vec<usize>,
}

impl PoolInner {
    /// Start the background monitor. It stops when the pool shuts down.
    pub(crate) fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let pool = self.weak.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.state.lock().recycling {
                    continue;
                }

                let report = pool.run_health_check().await;
                if !report.unhealthy.is_empty() {
                    tracing::warn!(
                        probed = report.probed,
                        unhealthy = ?report.unhealthy,
                        "Health check found unhealthy workers"
                    );
                }
                if let Some(outcome) = pool.recycle_if_idle().await {
                    tracing::info!(?outcome, "Idle recycle finished");
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }

    /// Probe every idle initialized worker once.
    pub(crate) async fn run_health_check(&self) -> HealthReport {
        let probes = {
            let mut state = self.state.lock();
            if state.terminated || state.recycling {
                return HealthReport::default();
            }
            let targets: Vec<(usize, u64)> = state
                .slots
                .iter()
                .filter(|slot| slot.record.is_available())
                .map(|slot| (slot.record.id, slot.record.generation))
                .collect();

            let mut probes = Vec::with_capacity(targets.len());
            for (worker_id, generation) in targets {
                let id = state.next_request_id();
                let (tx, rx) = oneshot::channel();
                let sent = state.slots[worker_id]
                    .handle
                    .as_ref()
                    .is_some_and(|handle| handle.send(PoolMessage::HealthCheck { id }));
                if sent {
                    state.probes.insert(id, tx);
                }
                probes.push((worker_id, generation, id, rx));
            }
            probes
        };

        let timeout = self.config.health_check_timeout;
        let answers = join_all(probes.into_iter().map(|(worker_id, generation, id, rx)| async move {
            (worker_id, generation, id, probe_answer(rx, timeout).await)
        }))
        .await;

        let mut report = HealthReport {
            probed: answers.len(),
            ..HealthReport::default()
        };
        {
            let mut state = self.state.lock();
            for (_, _, id, _) in &answers {
                state.probes.remove(id);
            }
            if state.terminated || state.recycling {
                return report;
            }
            for (worker_id, generation, _, answer) in answers {
                match answer {
                    Some(true) => report.healthy += 1,
                    // A worker that picked up a job after the probe answers
                    // behind it; its job timeout covers hangs.
                    None if state.slots.get(worker_id).is_some_and(|slot| {
                        slot.record.generation == generation && slot.record.is_busy()
                    }) =>
                    {
                        tracing::debug!(worker_id, "Health probe timed out behind a job; inconclusive");
                    }
                    _ => {
                        self.handle_worker_failure(&mut state, worker_id, generation, "failed health check");
                        report.unhealthy.push(worker_id);
                    }
                }
            }
            self.pump(&mut state);
        }
        self.notify();
        report
    }
}

/// `Some(healthy)` if the worker answered in time.
async fn probe_answer(rx: oneshot::Receiver<bool>, timeout: Duration) -> Option<bool> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(healthy)) => Some(healthy),
        Ok(Err(_)) => Some(false),
        Err(_) => None,
    }
}
