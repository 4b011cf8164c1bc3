//! Pool initialization: spawn every worker, then run the two-phase
//! READY → INIT handshake with partial-readiness tolerance.

use serde::Serialize;

use crate::error::{HandshakePhase, WorkerError};
use crate::pool::scheduler::{PoolInner, WorkerSlot};
use crate::worker::WorkerState;

/// Outcome of a pool-wide initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub requested: usize,
    /// Workers that sent WORKER_READY within the ready timeout.
    pub ready: usize,
    /// Workers initialized when the init phase ended.
    pub initialized: usize,
}

impl InitReport {
    /// At least one worker can take jobs.
    pub fn is_usable(&self) -> bool {
        self.initialized > 0
    }
}

impl PoolInner {
    /// Replace every slot with a fresh worker and wait for the handshake.
    ///
    /// Never fails: workers that miss a deadline stay out of rotation and
    /// the pool proceeds with whatever is usable.
    pub(crate) async fn initialize_workers(&self) -> InitReport {
        let requested = self.config.pool_size;
        let stale = {
            let mut state = self.state.lock();
            if state.terminated {
                return InitReport {
                    requested,
                    ready: 0,
                    initialized: 0,
                };
            }
            let stale: Vec<_> = state.slots.drain(..).filter_map(|slot| slot.handle).collect();
            for worker_id in 0..requested {
                let generation = state.next_generation();
                state
                    .slots
                    .push(WorkerSlot::new(worker_id, generation, self.config.failure_window));
                match self.spawner.spawn(worker_id) {
                    Ok(connection) => {
                        self.attach(&mut state, worker_id, connection);
                        self.arm_handshake_deadline(worker_id, generation);
                    }
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "Failed to spawn worker");
                        self.handle_worker_failure(&mut state, worker_id, generation, "spawn failed");
                    }
                }
            }
            stale
        };
        for handle in stale {
            handle.shutdown();
        }

        self.wait_until(self.config.ready_timeout, |state| {
            state
                .slots
                .iter()
                .all(|slot| slot.record.state != WorkerState::Spawned)
        })
        .await;

        let ready = self.count_slots(|state| state.has_reported_ready());
        if ready < requested {
            if ready * 2 >= requested {
                tracing::warn!(ready, requested, "Not all workers reported ready; continuing with partial pool");
            } else {
                tracing::error!(ready, requested, "Fewer than half of the workers reported ready");
            }
        }

        self.wait_until(self.config.init_timeout, |state| {
            let slots = &state.slots;
            slots.iter().any(|slot| slot.record.is_initialized())
                || !slots.iter().any(|slot| slot.record.state == WorkerState::Ready)
        })
        .await;

        let initialized = self.count_slots(|state| state == WorkerState::Initialized);
        if initialized == 0 {
            tracing::error!(
                requested,
                timeout_ms = self.config.init_timeout.as_millis() as u64,
                "No worker initialized; serving fallback estimates"
            );
        } else {
            tracing::info!(initialized, ready, requested, "Worker pool initialized");
        }

        InitReport {
            requested,
            ready,
            initialized,
        }
    }

    /// Hand a worker that has not completed its handshake within
    /// `ready_timeout + init_timeout` to recovery.
    ///
    /// Stragglers that finish inside the window join the pool; a worker
    /// stuck in `Spawned` or `Ready` past it is treated like a crash.
    fn arm_handshake_deadline(&self, worker_id: usize, generation: u64) {
        let pool = self.weak.clone();
        let shutdown = self.shutdown.clone();
        let deadline = self.config.ready_timeout + self.config.init_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    if let Some(pool) = pool.upgrade() {
                        pool.on_handshake_deadline(worker_id, generation);
                    }
                }
            }
        });
    }

    fn on_handshake_deadline(&self, worker_id: usize, generation: u64) {
        let mut state = self.state.lock();
        let current = state.worker_state(worker_id, generation);
        if !matches!(current, Some(WorkerState::Spawned | WorkerState::Ready)) {
            return;
        }
        tracing::warn!(worker_id, generation, state = ?current, "Worker missed its handshake deadline");
        self.handle_worker_failure(&mut state, worker_id, generation, "handshake timed out");
        drop(state);
        self.notify();
    }

    /// Single-worker handshake used by recovery.
    pub(crate) async fn await_handshake(&self, worker_id: usize, generation: u64) -> Result<(), WorkerError> {
        let not_spawned = |s: Option<WorkerState>| s != Some(WorkerState::Spawned);
        self.wait_until(self.config.ready_timeout, |state| {
            not_spawned(state.worker_state(worker_id, generation))
        })
        .await;

        let current = self.state.lock().worker_state(worker_id, generation);
        match current {
            Some(WorkerState::Spawned) => {
                return Err(WorkerError::HandshakeTimeout {
                    id: worker_id,
                    phase: HandshakePhase::Ready,
                    timeout: self.config.ready_timeout,
                });
            }
            Some(WorkerState::Ready | WorkerState::Initialized) => {}
            _ => return Err(WorkerError::Disconnected { id: worker_id }),
        }

        self.wait_until(self.config.init_timeout, |state| {
            state.worker_state(worker_id, generation) != Some(WorkerState::Ready)
        })
        .await;

        let current = self.state.lock().worker_state(worker_id, generation);
        match current {
            Some(WorkerState::Initialized) => Ok(()),
            Some(WorkerState::Ready) => Err(WorkerError::HandshakeTimeout {
                id: worker_id,
                phase: HandshakePhase::Init,
                timeout: self.config.init_timeout,
            }),
            _ => Err(WorkerError::Disconnected { id: worker_id }),
        }
    }

    fn count_slots(&self, predicate: impl Fn(WorkerState) -> bool) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| predicate(slot.record.state))
            .count()
    }
}
