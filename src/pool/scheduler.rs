//! Dispatch core: pool state, admission, worker events, timeouts and
//! cancellation.
//!
//! All orchestrator state sits behind one `parking_lot::Mutex` that is never
//! held across an `.await`. Every method taking `&mut PoolState` runs to
//! completion under that lock, so invariants only need to hold at lock
//! release. Background tasks (listeners, timers, watchers) hold a `Weak`
//! reference and revalidate worker generations before touching a slot.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{CancelReason, JobError};
use crate::estimator::FallbackEstimator;
use crate::pool::dedup::{Deduplicator, Fingerprint, SharedCount};
use crate::pool::job::{ActiveJob, Job, JobId, JobOutput, JobPayload, JobResult, SubmitOptions};
use crate::pool::queue::JobQueue;
use crate::pool::recovery::FailureWindow;
use crate::pool::stats::PoolMetrics;
use crate::protocol::{PoolMessage, RequestId, WorkerMessage};
use crate::worker::handle::{WorkerConnection, WorkerEvent, WorkerHandle, WorkerSpawner};
use crate::worker::{WorkerRecord, WorkerState};

/// One worker position in the pool.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub record: WorkerRecord,
    pub handle: Option<WorkerHandle>,
    pub failures: FailureWindow,
}

impl WorkerSlot {
    pub fn new(id: usize, generation: u64, failure_window: Duration) -> Self {
        Self {
            record: WorkerRecord::new(id, generation),
            handle: None,
            failures: FailureWindow::new(failure_window),
        }
    }
}

/// Everything the orchestrator mutates.
pub(crate) struct PoolState {
    pub slots: Vec<WorkerSlot>,
    pub queue: JobQueue,
    pub active: HashMap<JobId, ActiveJob>,
    pub dedup: Deduplicator,
    pub probes: HashMap<RequestId, oneshot::Sender<bool>>,
    pub metrics: PoolMetrics,
    pub accepting_jobs: bool,
    pub recycling: bool,
    pub terminated: bool,
    /// Bumped when a recycle finishes.
    pub recycle_epoch: u64,
    /// Jobs dispatched since the last recycle.
    pub jobs_since_recycle: u64,
    /// Time of the last submission.
    pub last_activity: Instant,
    next_request_id: RequestId,
    next_generation: u64,
}

impl PoolState {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            queue: JobQueue::new(max_queue_size),
            active: HashMap::new(),
            dedup: Deduplicator::default(),
            probes: HashMap::new(),
            metrics: PoolMetrics::default(),
            accepting_jobs: false,
            recycling: false,
            terminated: false,
            recycle_epoch: 0,
            jobs_since_recycle: 0,
            last_activity: Instant::now(),
            next_request_id: 1,
            next_generation: 1,
        }
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    pub fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// The slot, if it still holds the given incarnation.
    pub fn slot_mut(&mut self, worker_id: usize, generation: u64) -> Option<&mut WorkerSlot> {
        self.slots
            .get_mut(worker_id)
            .filter(|slot| slot.record.generation == generation)
    }

    pub fn worker_state(&self, worker_id: usize, generation: u64) -> Option<WorkerState> {
        self.slots
            .get(worker_id)
            .filter(|slot| slot.record.generation == generation)
            .map(|slot| slot.record.state)
    }

    fn idle_worker(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.record.is_available() && slot.handle.is_some())
    }
}

/// Shared core behind [`WorkerPool`](crate::pool::WorkerPool).
pub(crate) struct PoolInner {
    pub config: PoolConfig,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub estimator: Arc<dyn FallbackEstimator>,
    pub state: Mutex<PoolState>,
    changed: watch::Sender<u64>,
    pub recovery_locks: Vec<Arc<tokio::sync::Mutex<()>>>,
    pub recycle_lock: tokio::sync::Mutex<()>,
    pub shutdown: CancellationToken,
    pub weak: Weak<PoolInner>,
}

impl PoolInner {
    pub fn new(
        config: PoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
        estimator: Arc<dyn FallbackEstimator>,
    ) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        let recovery_locks = (0..config.pool_size)
            .map(|_| Arc::new(tokio::sync::Mutex::new(())))
            .collect();
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(PoolState::new(config.max_queue_size)),
            config,
            spawner,
            estimator,
            changed,
            recovery_locks,
            recycle_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    /// Wake everything blocked in [`wait_until`](Self::wait_until).
    pub fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Wait until `ready` holds or `timeout` elapses. Returns the final
    /// evaluation of `ready`.
    pub async fn wait_until<F>(&self, timeout: Duration, mut ready: F) -> bool
    where
        F: FnMut(&PoolState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.changed.subscribe();
        loop {
            if ready(&*self.state.lock()) {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                changed = tokio::time::timeout_at(deadline, changes.changed()) => {
                    if !matches!(changed, Ok(Ok(()))) {
                        return ready(&*self.state.lock());
                    }
                }
            }
        }
    }

    // ── Admission ──────────────────────────────────────────────────────

    /// Admit a single-text count. Admission happens before this returns;
    /// the future only waits for the outcome.
    pub fn admit_count(
        &self,
        text: String,
        options: SubmitOptions,
    ) -> BoxFuture<'static, Result<usize, JobError>> {
        let mut state = self.state.lock();
        state.metrics.submitted += 1;
        state.last_activity = Instant::now();
        let id = state.next_request_id();

        if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            state.metrics.cancelled += 1;
            return future::ready(Err(JobError::cancelled(id, CancelReason::Caller))).boxed();
        }

        if let Some(reason) = self.bypass_reason(&state, text.len()) {
            state.metrics.fallbacks += 1;
            drop(state);
            tracing::debug!(job_id = id, reason, "Serving fallback estimate");
            return future::ready(Ok(self.estimator.estimate(&text))).boxed();
        }

        let fingerprint = Fingerprint::of(&text);
        if let Some(joined) = state.dedup.subscribe(&fingerprint) {
            state.metrics.dedup_hits += 1;
            tracing::trace!(job_id = id, shared_job = joined.job_id, "Joining identical in-flight request");
            if let Some(token) = &options.cancel {
                self.watch_subscriber(fingerprint, joined.job_id, token.clone(), joined.controller);
            }
            return with_caller_cancellation(id, joined.result, options.cancel);
        }

        // Caller tokens act per subscriber, never on the shared job itself.
        let job_options = SubmitOptions::new().with_priority(options.priority);
        let (reply, outcome) = oneshot::channel();
        let job = Job::new(id, JobPayload::Count(text), &job_options, Some(fingerprint), reply);
        let shared = async move {
            match outcome.await {
                Ok(result) => result.map(JobOutput::total),
                Err(_) => Err(JobError::cancelled(id, CancelReason::Dropped)),
            }
        }
        .boxed()
        .shared();
        state
            .dedup
            .insert(fingerprint, id, shared.clone(), job.controller());

        if let Some(token) = &options.cancel {
            self.watch_subscriber(fingerprint, id, token.clone(), job.controller());
        }
        self.place(&mut state, job);
        drop(state);
        self.notify();
        with_caller_cancellation(id, shared, options.cancel)
    }

    /// Admit a contiguous chunk of texts as one batch job.
    pub fn admit_batch(
        &self,
        texts: Vec<String>,
        options: SubmitOptions,
    ) -> BoxFuture<'static, Result<Vec<usize>, JobError>> {
        let mut state = self.state.lock();
        state.metrics.submitted += 1;
        state.last_activity = Instant::now();
        let id = state.next_request_id();

        if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            state.metrics.cancelled += 1;
            return future::ready(Err(JobError::cancelled(id, CancelReason::Caller))).boxed();
        }

        let payload = JobPayload::Batch(texts);
        if let Some(reason) = self.bypass_reason(&state, payload.size_bytes()) {
            state.metrics.fallbacks += 1;
            drop(state);
            tracing::debug!(job_id = id, reason, "Serving fallback estimates for batch");
            let counts = payload.estimate(self.estimator.as_ref()).into_counts();
            return future::ready(Ok(counts)).boxed();
        }

        let (reply, outcome) = oneshot::channel();
        let job = Job::new(id, payload, &options, None, reply);
        if let Some(token) = options.cancel {
            self.watch_cancellation(id, token, job.controller());
        }
        self.place(&mut state, job);
        drop(state);
        self.notify();

        async move {
            match outcome.await {
                Ok(result) => result.map(JobOutput::into_counts),
                Err(_) => Err(JobError::cancelled(id, CancelReason::Dropped)),
            }
        }
        .boxed()
    }

    fn bypass_reason(&self, state: &PoolState, payload_bytes: usize) -> Option<&'static str> {
        if state.terminated {
            Some("pool terminated")
        } else if !state.accepting_jobs {
            Some("pool not accepting jobs")
        } else if payload_bytes > self.config.max_payload_bytes {
            Some("payload too large")
        } else {
            None
        }
    }

    /// Queue a job, settling any evicted entry, then dispatch what we can.
    fn place(&self, state: &mut PoolState, job: Job) {
        if let Some(evicted) = state.queue.push(job) {
            state.metrics.dropped += 1;
            tracing::warn!(
                job_id = evicted.id,
                priority = evicted.priority,
                queue_len = state.queue.len(),
                "Queue full; evicted job served by fallback estimate"
            );
            self.settle_with_fallback(state, evicted);
        }
        self.pump(state);
    }

    // ── Dispatch ───────────────────────────────────────────────────────

    /// Hand queued jobs to idle workers until one side runs out.
    pub fn pump(&self, state: &mut PoolState) {
        while !state.terminated && !state.recycling {
            let Some(worker_id) = state.idle_worker() else {
                break;
            };
            let Some(job) = state.queue.pop() else {
                break;
            };
            self.dispatch(state, worker_id, job);
        }
    }

    fn dispatch(&self, state: &mut PoolState, worker_id: usize, job: Job) {
        if job.is_cancelled() {
            state.metrics.cancelled += 1;
            let err = JobError::cancelled(job.id, CancelReason::Caller);
            self.settle(state, job, Err(err));
            return;
        }

        let slot = &mut state.slots[worker_id];
        let generation = slot.record.generation;
        let sent = slot
            .handle
            .as_ref()
            .is_some_and(|handle| handle.send(job.payload.to_message(job.id)));
        if !sent {
            state.queue.requeue(job);
            self.handle_worker_failure(state, worker_id, generation, "worker inbox closed");
            return;
        }

        slot.record.active_job = Some(job.id);
        state.jobs_since_recycle += 1;
        tracing::trace!(job_id = job.id, worker_id, "Dispatched job");

        let job_id = job.id;
        let controller = job.controller();
        let payload_size = job.payload.size_bytes();
        state.active.insert(
            job_id,
            ActiveJob {
                job,
                worker_id,
                generation,
                started_at: Instant::now(),
                payload_size,
            },
        );
        self.arm_timeout(job_id, controller);
    }

    /// Remove an active job and free its worker if the worker still holds it.
    fn complete_active(&self, state: &mut PoolState, job_id: JobId) -> Option<ActiveJob> {
        let active = state.active.remove(&job_id)?;
        if let Some(slot) = state.slot_mut(active.worker_id, active.generation)
            && slot.record.active_job == Some(job_id)
        {
            slot.record.active_job = None;
        }
        Some(active)
    }

    // ── Settlement ─────────────────────────────────────────────────────

    pub fn settle(&self, state: &mut PoolState, job: Job, result: JobResult) {
        if let Some(fp) = &job.fingerprint {
            state.dedup.release(fp, job.id);
        }
        job.settle(result);
    }

    pub fn settle_with_fallback(&self, state: &mut PoolState, job: Job) {
        state.metrics.fallbacks += 1;
        let output = job.payload.estimate(self.estimator.as_ref());
        self.settle(state, job, Ok(output));
    }

    /// Resolve every queued job via the fallback estimator.
    pub fn drain_queue_with_fallback(&self, state: &mut PoolState) -> usize {
        let queued = state.queue.drain();
        let count = queued.len();
        for job in queued {
            self.settle_with_fallback(state, job);
        }
        count
    }

    // ── Timers and cancellation ────────────────────────────────────────

    fn arm_timeout(&self, job_id: JobId, controller: CancellationToken) {
        let pool = self.weak.clone();
        let timeout = self.config.job_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(pool) = pool.upgrade() {
                        pool.on_job_timeout(job_id);
                    }
                }
            }
        });
    }

    fn on_job_timeout(&self, job_id: JobId) {
        let mut state = self.state.lock();
        let Some(active) = self.complete_active(&mut state, job_id) else {
            return;
        };
        state.metrics.timeouts += 1;
        state
            .metrics
            .record_processed(active.started_at.elapsed(), false);
        tracing::warn!(
            job_id,
            worker_id = active.worker_id,
            payload_bytes = active.payload_size,
            timeout_ms = self.config.job_timeout.as_millis() as u64,
            "Job timed out; serving fallback estimate"
        );
        self.settle_with_fallback(&mut state, active.job);
        self.pump(&mut state);
        drop(state);
        self.notify();
    }

    fn watch_cancellation(&self, job_id: JobId, token: CancellationToken, controller: CancellationToken) {
        let pool = self.weak.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.cancelled() => {}
                _ = token.cancelled() => {
                    if let Some(pool) = pool.upgrade() {
                        pool.cancel_job(job_id);
                    }
                }
            }
        });
    }

    /// Caller-initiated cancellation of an undeduplicated job.
    fn cancel_job(&self, job_id: JobId) {
        let mut state = self.state.lock();
        if self.abandon_job(&mut state, job_id) {
            state.metrics.cancelled += 1;
            self.pump(&mut state);
        }
        drop(state);
        self.notify();
    }

    fn watch_subscriber(
        &self,
        fingerprint: Fingerprint,
        job_id: JobId,
        token: CancellationToken,
        controller: CancellationToken,
    ) {
        let pool = self.weak.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.cancelled() => {}
                _ = token.cancelled() => {
                    if let Some(pool) = pool.upgrade() {
                        pool.drop_subscriber(fingerprint, job_id);
                    }
                }
            }
        });
    }

    /// One caller of a deduplicated job cancelled. The job is abandoned
    /// once nobody is left waiting for it.
    fn drop_subscriber(&self, fingerprint: Fingerprint, job_id: JobId) {
        let mut state = self.state.lock();
        let Some(abandoned) = state.dedup.unsubscribe(&fingerprint, job_id) else {
            return;
        };
        state.metrics.cancelled += 1;
        if abandoned && self.abandon_job(&mut state, job_id) {
            self.pump(&mut state);
        }
        drop(state);
        self.notify();
    }

    /// Remove a job wherever it is and reject it with
    /// [`CancelReason::Caller`]. A queued job is never dispatched; an active
    /// job's worker is freed at once.
    fn abandon_job(&self, state: &mut PoolState, job_id: JobId) -> bool {
        let job = match state.queue.remove(job_id) {
            Some(job) => job,
            None => match self.complete_active(state, job_id) {
                Some(active) => {
                    state
                        .metrics
                        .record_processed(active.started_at.elapsed(), false);
                    active.job
                }
                None => return false,
            },
        };
        tracing::debug!(job_id, "Job cancelled by caller");
        self.settle(state, job, Err(JobError::cancelled(job_id, CancelReason::Caller)));
        true
    }

    // ── Worker wiring ──────────────────────────────────────────────────

    /// Install a connection into its slot and start listening to it.
    pub fn attach(&self, state: &mut PoolState, worker_id: usize, connection: WorkerConnection) {
        let Some(slot) = state.slots.get_mut(worker_id) else {
            connection.close();
            return;
        };
        let generation = slot.record.generation;
        let (outbox, events, terminator) = connection.into_parts();
        let listener = tokio::spawn(listen(self.weak.clone(), worker_id, generation, events));
        if let Some(old) = slot.handle.replace(WorkerHandle::new(outbox, listener, terminator)) {
            old.shutdown();
        }
    }

    pub fn handle_worker_event(&self, worker_id: usize, generation: u64, event: WorkerEvent) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        if state.worker_state(worker_id, generation).is_none() {
            tracing::debug!(worker_id, generation, "Ignoring event from replaced worker");
            return;
        }

        match event {
            WorkerEvent::Message(message) => self.handle_message(&mut state, worker_id, generation, message),
            WorkerEvent::Crashed { reason } => {
                self.handle_worker_failure(&mut state, worker_id, generation, &reason);
                self.pump(&mut state);
            }
        }
        drop(state);
        self.notify();
    }

    fn handle_message(
        &self,
        state: &mut PoolState,
        worker_id: usize,
        generation: u64,
        message: WorkerMessage,
    ) {
        match message {
            WorkerMessage::WorkerReady => self.on_worker_ready(state, worker_id, generation),
            WorkerMessage::InitComplete { id, success } => {
                self.on_init_complete(state, worker_id, generation, id, success)
            }
            WorkerMessage::Result { id, result, fallback } => {
                self.on_result(state, worker_id, id, fallback, |payload| match payload {
                    JobPayload::Count(_) => Some(JobOutput::Count(result)),
                    JobPayload::Batch(_) => None,
                })
            }
            WorkerMessage::BatchResult { id, result, fallback } => {
                self.on_result(state, worker_id, id, fallback, |payload| match payload {
                    JobPayload::Batch(texts) if texts.len() == result.len() => {
                        Some(JobOutput::Batch(result))
                    }
                    _ => None,
                })
            }
            WorkerMessage::Error { id, error } => {
                let Some(active) = self.complete_active(state, id) else {
                    tracing::debug!(job_id = id, worker_id, "Ignoring error for settled job");
                    return;
                };
                state.metrics.failed += 1;
                state
                    .metrics
                    .record_processed(active.started_at.elapsed(), false);
                tracing::warn!(job_id = id, worker_id, error = %error, "Worker reported job error");
                self.settle_with_fallback(state, active.job);
                self.pump(state);
            }
            WorkerMessage::HealthResponse { id, healthy } => {
                if let Some(probe) = state.probes.remove(&id) {
                    let _ = probe.send(healthy);
                }
            }
        }
    }

    fn on_worker_ready(&self, state: &mut PoolState, worker_id: usize, generation: u64) {
        let init_id = state.next_request_id();
        let Some(slot) = state.slot_mut(worker_id, generation) else {
            return;
        };
        if slot.record.transition_to(WorkerState::Ready).is_err() {
            tracing::debug!(worker_id, state = %slot.record.state, "Duplicate WORKER_READY ignored");
            return;
        }
        slot.record.init_request = Some(init_id);
        let sent = slot
            .handle
            .as_ref()
            .is_some_and(|handle| handle.send(PoolMessage::Init { id: init_id }));
        tracing::debug!(worker_id, generation, "Worker ready; sent INIT");
        if !sent {
            self.handle_worker_failure(state, worker_id, generation, "worker inbox closed");
        }
    }

    fn on_init_complete(
        &self,
        state: &mut PoolState,
        worker_id: usize,
        generation: u64,
        id: RequestId,
        success: bool,
    ) {
        let Some(slot) = state.slot_mut(worker_id, generation) else {
            return;
        };
        if slot.record.init_request != Some(id) {
            tracing::debug!(worker_id, request_id = id, "Ignoring unexpected INIT_COMPLETE");
            return;
        }
        slot.record.init_request = None;

        if !success {
            tracing::warn!(worker_id, generation, "Worker rejected INIT");
            self.handle_worker_failure(state, worker_id, generation, "init rejected");
            return;
        }

        if let Err(e) = slot.record.transition_to(WorkerState::Initialized) {
            tracing::warn!(worker_id, error = %e, "Unexpected INIT_COMPLETE");
            return;
        }
        tracing::info!(worker_id, generation, "Worker initialized");
        if !state.terminated && !state.recycling {
            state.accepting_jobs = true;
        }
        self.pump(state);
    }

    fn on_result<F>(&self, state: &mut PoolState, worker_id: usize, id: JobId, fallback: bool, output: F)
    where
        F: FnOnce(&JobPayload) -> Option<JobOutput>,
    {
        let Some(active) = self.complete_active(state, id) else {
            tracing::debug!(job_id = id, worker_id, "Ignoring late result");
            return;
        };
        if let Some(slot) = state.slot_mut(active.worker_id, active.generation) {
            slot.record.jobs_completed += 1;
        }
        let latency = active.started_at.elapsed();

        match output(&active.job.payload) {
            Some(output) => {
                state.metrics.record_processed(latency, true);
                if fallback {
                    state.metrics.worker_fallbacks += 1;
                }
                tracing::trace!(job_id = id, worker_id, latency_ms = latency.as_millis() as u64, "Job completed");
                self.settle(state, active.job, Ok(output));
            }
            None => {
                state.metrics.failed += 1;
                state.metrics.record_processed(latency, false);
                tracing::warn!(job_id = id, worker_id, "Worker result does not match request; serving fallback");
                self.settle_with_fallback(state, active.job);
            }
        }
        self.pump(state);
    }

    /// Mark a worker failed and settle its in-flight job. Returns false if
    /// the incarnation is gone or already failed.
    pub fn fail_worker(&self, state: &mut PoolState, worker_id: usize, generation: u64, reason: &str) -> bool {
        let Some(slot) = state.slot_mut(worker_id, generation) else {
            return false;
        };
        if matches!(slot.record.state, WorkerState::Failed | WorkerState::Retired) {
            return false;
        }
        tracing::warn!(worker_id, generation, reason, "Worker failed");
        if let Err(e) = slot.record.transition_to(WorkerState::Failed) {
            tracing::warn!(worker_id, error = %e, "Could not mark worker failed");
            return false;
        }
        let active_job = slot.record.active_job.take();

        if let Some(job_id) = active_job
            && let Some(active) = state.active.remove(&job_id)
        {
            state.metrics.failed += 1;
            state
                .metrics
                .record_processed(active.started_at.elapsed(), false);
            self.settle_with_fallback(state, active.job);
        }
        true
    }

    /// Crash path: fail the worker and hand it to recovery.
    pub fn handle_worker_failure(&self, state: &mut PoolState, worker_id: usize, generation: u64, reason: &str) {
        if self.fail_worker(state, worker_id, generation, reason) && !state.terminated && !state.recycling {
            self.spawn_recovery(worker_id, generation);
        }
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Shut the pool down. Pending jobs are rejected with
    /// [`CancelReason::PoolTerminated`]. Idempotent.
    pub fn terminate(&self) {
        let (jobs, handles) = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.accepting_jobs = false;

            let mut jobs = state.queue.drain();
            jobs.extend(state.active.drain().map(|(_, active)| active.job));
            state.metrics.cancelled += jobs.len() as u64;
            state.dedup.clear();
            state.probes.clear();

            let handles: Vec<_> = state
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.record.active_job = None;
                    slot.handle.take()
                })
                .collect();
            (jobs, handles)
        };

        self.shutdown.cancel();
        let rejected = jobs.len();
        for job in jobs {
            let id = job.id;
            job.settle(Err(JobError::cancelled(id, CancelReason::PoolTerminated)));
        }
        for handle in handles {
            handle.shutdown();
        }
        tracing::info!(rejected, "Worker pool terminated");
        self.notify();
    }
}

/// A caller's view of a shared count: its own token rejects only its own
/// future.
fn with_caller_cancellation(
    id: JobId,
    result: SharedCount,
    cancel: Option<CancellationToken>,
) -> BoxFuture<'static, Result<usize, JobError>> {
    let Some(token) = cancel else {
        return result.boxed();
    };
    async move {
        tokio::select! {
            biased;
            outcome = result => outcome,
            _ = token.cancelled() => Err(JobError::cancelled(id, CancelReason::Caller)),
        }
    }
    .boxed()
}

/// Forward a worker's events to the pool. A closed channel is a crash.
async fn listen(
    pool: Weak<PoolInner>,
    worker_id: usize,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(pool) = pool.upgrade() else {
            return;
        };
        pool.handle_worker_event(worker_id, generation, event);
    }
    if let Some(pool) = pool.upgrade() {
        pool.handle_worker_event(
            worker_id,
            generation,
            WorkerEvent::Crashed {
                reason: "worker channel closed".to_string(),
            },
        );
    }
}
