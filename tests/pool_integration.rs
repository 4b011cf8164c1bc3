//! Integration tests for the worker pool.
//!
//! Most tests drive a real `WorkerPool` through `ScriptedSpawner`, whose
//! workers are tokio tasks that answer the protocol according to a per-spawn
//! script. Payload conventions understood by scripted workers:
//! - `sleep:<ms> ...` delays the reply by `<ms>` milliseconds
//! - `error: ...` answers with an ERROR message
//! - anything else counts whitespace-separated words
//!
//! The fallback estimator returns `1000 + len`, so degraded answers are easy
//! to tell apart from worker answers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use token_pool::config::{PoolConfig, RecycleConfig};
use token_pool::error::{CancelReason, WorkerError};
use token_pool::pool::{PoolStats, PoolStatus, RecycleOutcome, SubmitOptions, WorkerPool};
use token_pool::protocol::{PoolMessage, WorkerMessage};
use token_pool::worker::{
    HeuristicTokenizer, ProcessSpawner, ThreadSpawner, WorkerConnection, WorkerEvent, WorkerSpawner,
};
use token_pool::CharRatioEstimator;

/// Maximum time any test is allowed to wait before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn fallback(text: &str) -> usize {
    1000 + text.len()
}

/// How one spawned worker behaves.
#[derive(Debug, Clone, Copy, Default)]
struct Script {
    /// Never send WORKER_READY.
    never_ready: bool,
    /// Answer INIT with `success: false`.
    reject_init: bool,
    /// Never answer INIT.
    silent_init: bool,
    /// Crash as soon as a COUNT arrives.
    crash_on_count: bool,
    /// Crash right after sending WORKER_READY.
    crash_after_ready: bool,
    /// Answer health probes with `healthy: false`.
    unhealthy: bool,
    /// Ignore health probes.
    silent_health: bool,
}

type ScriptFn = dyn Fn(usize, usize) -> Script + Send + Sync;

/// Spawns tokio-task workers. The script function receives the slot id and
/// the overall spawn sequence number.
#[derive(Clone)]
struct ScriptedSpawner {
    script: Arc<ScriptFn>,
    spawns: Arc<AtomicUsize>,
    dispatched: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSpawner {
    fn new(script: impl Fn(usize, usize) -> Script + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            spawns: Arc::new(AtomicUsize::new(0)),
            dispatched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn healthy() -> Self {
        Self::new(|_, _| Script::default())
    }

    fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().clone()
    }

    fn dispatch_count(&self, text: &str) -> usize {
        self.dispatched.lock().iter().filter(|t| *t == text).count()
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self, worker_id: usize) -> Result<WorkerConnection, WorkerError> {
        let seq = self.spawns.fetch_add(1, Ordering::SeqCst);
        let script = (self.script)(worker_id, seq);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_scripted_worker(script, out_rx, ev_tx, Arc::clone(&self.dispatched)));
        Ok(WorkerConnection::new(out_tx, ev_rx))
    }
}

async fn run_scripted_worker(
    script: Script,
    mut inbox: mpsc::UnboundedReceiver<PoolMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    dispatched: Arc<Mutex<Vec<String>>>,
) {
    let reply = |message: WorkerMessage| {
        let _ = events.send(WorkerEvent::Message(message));
    };
    let crash = |reason: &str| {
        let _ = events.send(WorkerEvent::Crashed {
            reason: reason.to_string(),
        });
    };

    if !script.never_ready {
        reply(WorkerMessage::WorkerReady);
        if script.crash_after_ready {
            crash("scripted crash after ready");
            return;
        }
    }

    while let Some(message) = inbox.recv().await {
        match message {
            PoolMessage::Init { id } => {
                if !script.silent_init {
                    reply(WorkerMessage::InitComplete {
                        id,
                        success: !script.reject_init,
                    });
                }
            }
            PoolMessage::Count { id, payload } => {
                dispatched.lock().push(payload.clone());
                if script.crash_on_count {
                    crash("scripted crash on count");
                    return;
                }
                delay_for(&payload).await;
                if payload.starts_with("error:") {
                    reply(WorkerMessage::Error {
                        id,
                        error: "scripted failure".to_string(),
                    });
                } else {
                    reply(WorkerMessage::Result {
                        id,
                        result: words(&payload),
                        fallback: false,
                    });
                }
            }
            PoolMessage::BatchCount { id, payload } => {
                dispatched.lock().extend(payload.iter().cloned());
                if script.crash_on_count {
                    crash("scripted crash on batch");
                    return;
                }
                reply(WorkerMessage::BatchResult {
                    id,
                    result: payload.iter().map(|t| words(t)).collect(),
                    fallback: false,
                });
            }
            PoolMessage::HealthCheck { id } => {
                if !script.silent_health {
                    reply(WorkerMessage::HealthResponse {
                        id,
                        healthy: !script.unhealthy,
                    });
                }
            }
            PoolMessage::Exit => break,
        }
    }
}

fn words(text: &str) -> usize {
    text.split_whitespace().count()
}

async fn delay_for(payload: &str) {
    let millis = payload
        .strip_prefix("sleep:")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|ms| ms.parse::<u64>().ok());
    if let Some(ms) = millis {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn test_config(pool_size: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        max_queue_size: 100,
        job_timeout: Duration::from_secs(2),
        ready_timeout: Duration::from_millis(300),
        init_timeout: Duration::from_millis(300),
        health_check_interval: Duration::from_secs(60),
        health_check_timeout: Duration::from_millis(100),
        failure_window: Duration::from_secs(10),
        max_failures_in_window: 3,
        recovery_backoff: Duration::from_millis(10),
        recycle: RecycleConfig {
            drain_poll_interval: Duration::from_millis(10),
            drain_stable_checks: 5,
            drain_ceiling: Duration::from_millis(500),
            ..RecycleConfig::default()
        },
        ..PoolConfig::default()
    }
}

async fn start(config: PoolConfig, spawner: &ScriptedSpawner) -> WorkerPool {
    timeout(TEST_TIMEOUT, WorkerPool::start(config, spawner.clone(), fallback))
        .await
        .expect("pool start hung")
        .expect("invalid config")
}

async fn eventually(pool: &WorkerPool, what: &str, check: impl Fn(&PoolStats) -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let stats = pool.stats();
        if check(&stats) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {stats:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn submit_returns_worker_count() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;

    let report = pool.init_report();
    assert_eq!((report.requested, report.ready, report.initialized), (2, 2, 2));
    assert_eq!(pool.status(), PoolStatus::Ready);

    let count = pool.submit("hello token world", SubmitOptions::new()).await.unwrap();
    assert_eq!(count, 3);

    let stats = pool.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(stats.available_workers, 2);
}

#[tokio::test]
async fn every_job_settles_exactly_once() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;

    let jobs: Vec<_> = (0..20)
        .map(|i| pool.submit(format!("sleep:5 job {i}"), SubmitOptions::new()))
        .collect();
    assert!(pool.stats().queue_length > 0);

    let results = timeout(TEST_TIMEOUT, futures::future::join_all(jobs)).await.unwrap();
    assert!(results.iter().all(|r| *r == Ok(3)));

    let stats = pool.stats();
    assert_eq!(stats.processed, 20);
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(spawner.dispatched().len(), 20);
}

#[tokio::test]
async fn overflow_evicts_and_serves_fallback() {
    let spawner = ScriptedSpawner::healthy();
    let config = PoolConfig {
        max_queue_size: 5,
        ..test_config(1)
    };
    let pool = start(config, &spawner).await;

    let blocker = pool.submit("sleep:100 blocker", SubmitOptions::new());
    let texts: Vec<String> = (0..8).map(|i| format!("item {i}")).collect();
    let jobs: Vec<_> = texts
        .iter()
        .map(|t| pool.submit(t.clone(), SubmitOptions::new()))
        .collect();

    assert_eq!(pool.stats().dropped_requests, 3);
    assert_eq!(pool.stats().queue_length, 5);

    let results = timeout(TEST_TIMEOUT, futures::future::join_all(jobs)).await.unwrap();
    for (i, result) in results.into_iter().enumerate() {
        let expected = if i < 5 { 2 } else { fallback(&texts[i]) };
        assert_eq!(result, Ok(expected), "item {i}");
    }
    assert_eq!(blocker.await, Ok(2));
}

#[tokio::test]
async fn priority_order_is_respected() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;

    let a = pool.submit("sleep:100 blocker a", SubmitOptions::new());
    let b = pool.submit("sleep:400 blocker b", SubmitOptions::new());

    let jobs: Vec<_> = [5, 1, 3, 1, 2]
        .into_iter()
        .enumerate()
        .map(|(i, priority)| {
            pool.submit(
                format!("sleep:10 p{priority} #{i}"),
                SubmitOptions::new().with_priority(priority),
            )
        })
        .collect();

    timeout(TEST_TIMEOUT, futures::future::join_all(jobs)).await.unwrap();
    let order: Vec<String> = spawner
        .dispatched()
        .into_iter()
        .filter(|t| !t.contains("blocker"))
        .collect();
    assert_eq!(
        order,
        vec![
            "sleep:10 p1 #1",
            "sleep:10 p1 #3",
            "sleep:10 p2 #4",
            "sleep:10 p3 #2",
            "sleep:10 p5 #0",
        ]
    );
    let _ = futures::future::join(a, b).await;
}

#[tokio::test]
async fn identical_requests_share_one_dispatch() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;

    let text = "sleep:50 same words here";
    let first = pool.submit(text, SubmitOptions::new());
    let second = pool.submit(text, SubmitOptions::new());
    let (first, second) = futures::future::join(first, second).await;

    assert_eq!(first, Ok(4));
    assert_eq!(second, Ok(4));
    assert_eq!(spawner.dispatch_count(text), 1);
    assert_eq!(pool.stats().dedup_hits, 1);
    assert_eq!(pool.stats().inflight_fingerprints, 0);

    // Entry released on settle: a later request dispatches again.
    assert_eq!(pool.submit(text, SubmitOptions::new()).await, Ok(4));
    assert_eq!(spawner.dispatch_count(text), 2);
}

#[tokio::test]
async fn cancellable_identical_requests_share_one_dispatch() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;

    let text = "sleep:50 same words";
    let first = pool.submit(text, SubmitOptions::new().with_cancellation(CancellationToken::new()));
    let second = pool.submit(text, SubmitOptions::new().with_cancellation(CancellationToken::new()));
    let (first, second) = futures::future::join(first, second).await;

    assert_eq!(first, Ok(3));
    assert_eq!(second, Ok(3));
    assert_eq!(spawner.dispatch_count(text), 1);
    assert_eq!(pool.stats().dedup_hits, 1);
}

#[tokio::test]
async fn one_caller_cancelling_leaves_shared_request_running() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(1), &spawner).await;

    let text = "sleep:100 shared job";
    let token = CancellationToken::new();
    let leaving = pool.submit(text, SubmitOptions::new().with_cancellation(token.clone()));
    let staying = pool.submit(text, SubmitOptions::new());
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let err = timeout(TEST_TIMEOUT, leaving).await.unwrap().unwrap_err();
    assert_eq!(err.reason(), CancelReason::Caller);
    assert_eq!(timeout(TEST_TIMEOUT, staying).await.unwrap(), Ok(3));
    assert_eq!(spawner.dispatch_count(text), 1);

    let stats = pool.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.timeouts, 0);
}

#[tokio::test]
async fn shared_request_abandoned_when_every_caller_cancels() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(1), &spawner).await;

    let blocker = pool.submit("sleep:100 blocker", SubmitOptions::new());
    let text = "queued twice";
    let (a, b) = (CancellationToken::new(), CancellationToken::new());
    let first = pool.submit(text, SubmitOptions::new().with_cancellation(a.clone()));
    let second = pool.submit(text, SubmitOptions::new().with_cancellation(b.clone()));
    a.cancel();
    b.cancel();

    assert_eq!(first.await.unwrap_err().reason(), CancelReason::Caller);
    assert_eq!(second.await.unwrap_err().reason(), CancelReason::Caller);
    assert_eq!(blocker.await, Ok(2));

    eventually(&pool, "abandoned job", |s| s.queue_length == 0 && s.inflight_fingerprints == 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(spawner.dispatch_count(text), 0);
    assert_eq!(pool.stats().cancelled, 2);
}

#[tokio::test]
async fn oversized_payload_skips_workers() {
    let spawner = ScriptedSpawner::healthy();
    let config = PoolConfig {
        max_payload_bytes: 10,
        ..test_config(1)
    };
    let pool = start(config, &spawner).await;

    let text = "far more than ten bytes";
    assert_eq!(pool.submit(text, SubmitOptions::new()).await, Ok(fallback(text)));
    assert!(spawner.dispatched().is_empty());
    assert_eq!(pool.stats().fallbacks, 1);
}

#[tokio::test]
async fn worker_error_serves_fallback() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(1), &spawner).await;

    let text = "error: please";
    assert_eq!(pool.submit(text, SubmitOptions::new()).await, Ok(fallback(text)));
    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 0.0);

    // The worker stays usable.
    assert_eq!(pool.submit("still fine", SubmitOptions::new()).await, Ok(2));
}

// ── Timeouts and cancellation ───────────────────────────────────────────

#[tokio::test]
async fn timeout_frees_worker_and_ignores_late_result() {
    let spawner = ScriptedSpawner::healthy();
    let config = PoolConfig {
        job_timeout: Duration::from_millis(150),
        ..test_config(1)
    };
    let pool = start(config, &spawner).await;

    let slow = "sleep:200 slow job";
    let x = pool.submit(slow, SubmitOptions::new());
    let y = pool.submit("quick one", SubmitOptions::new());

    assert_eq!(timeout(TEST_TIMEOUT, x).await.unwrap(), Ok(fallback(slow)));
    assert_eq!(timeout(TEST_TIMEOUT, y).await.unwrap(), Ok(2));

    // Let the late result for the slow job arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = pool.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(stats.available_workers, 1);
}

#[tokio::test]
async fn cancelled_queued_job_is_never_dispatched() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(1), &spawner).await;

    let blocker = pool.submit("sleep:100 blocker", SubmitOptions::new());
    let token = CancellationToken::new();
    let victim = pool.submit("victim job", SubmitOptions::new().with_cancellation(token.clone()));
    token.cancel();

    let err = timeout(TEST_TIMEOUT, victim).await.unwrap().unwrap_err();
    assert_eq!(err.reason(), CancelReason::Caller);
    assert_eq!(blocker.await, Ok(2));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(spawner.dispatch_count("victim job"), 0);
    assert_eq!(pool.stats().cancelled, 1);
}

#[tokio::test]
async fn cancelling_active_job_releases_caller_and_worker() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(1), &spawner).await;

    let token = CancellationToken::new();
    let slow = pool.submit("sleep:300 slow", SubmitOptions::new().with_cancellation(token.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let started = Instant::now();
    token.cancel();

    let err = timeout(TEST_TIMEOUT, slow).await.unwrap().unwrap_err();
    assert_eq!(err.reason(), CancelReason::Caller);
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(pool.stats().active_jobs, 0);

    // The worker is free for the next job; it answers after the abandoned one.
    assert_eq!(timeout(TEST_TIMEOUT, pool.submit("next", SubmitOptions::new())).await.unwrap(), Ok(1));
}

#[tokio::test]
async fn pre_cancelled_token_rejects_immediately() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(1), &spawner).await;

    let token = CancellationToken::new();
    token.cancel();
    let err = pool
        .submit("never", SubmitOptions::new().with_cancellation(token))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), CancelReason::Caller);
    assert!(spawner.dispatched().is_empty());
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn partial_readiness_proceeds_with_ready_workers() {
    let spawner = ScriptedSpawner::new(|worker_id, _| Script {
        never_ready: worker_id == 3,
        ..Script::default()
    });
    let pool = start(test_config(4), &spawner).await;

    let report = pool.init_report();
    assert_eq!((report.ready, report.initialized), (3, 3));
    assert_eq!(pool.status(), PoolStatus::Degraded);
    assert_eq!(pool.submit("works anyway", SubmitOptions::new()).await, Ok(2));
}

#[tokio::test]
async fn worker_that_keeps_rejecting_init_is_retired() {
    let spawner = ScriptedSpawner::new(|worker_id, _| Script {
        reject_init: worker_id == 1,
        ..Script::default()
    });
    let pool = start(test_config(2), &spawner).await;

    assert_eq!(pool.init_report().initialized, 1);
    assert_eq!(pool.submit("one two", SubmitOptions::new()).await, Ok(2));

    eventually(&pool, "retirement", |s| s.permanently_failed_workers == 1).await;
    let stats = pool.stats();
    assert_eq!(stats.available_workers, 1);
    assert!(stats.accepting_jobs);
    assert_eq!(stats.status, PoolStatus::Degraded);
}

#[tokio::test]
async fn no_initialized_worker_serves_fallback() {
    let spawner = ScriptedSpawner::new(|_, _| Script {
        reject_init: true,
        ..Script::default()
    });
    let pool = start(test_config(2), &spawner).await;

    assert_eq!(pool.init_report().initialized, 0);
    assert_eq!(pool.submit("abc", SubmitOptions::new()).await, Ok(fallback("abc")));

    eventually(&pool, "retirement", |s| s.permanently_failed_workers == 2).await;
    assert_eq!(pool.status(), PoolStatus::Failed);
    assert_eq!(pool.submit("abcd", SubmitOptions::new()).await, Ok(fallback("abcd")));
}

#[tokio::test]
async fn worker_stuck_after_ready_is_replaced() {
    // The first incarnation of worker 1 never answers INIT.
    let spawner = ScriptedSpawner::new(|worker_id, seq| Script {
        silent_init: worker_id == 1 && seq == 1,
        ..Script::default()
    });
    let pool = start(test_config(2), &spawner).await;
    assert_eq!(pool.init_report().initialized, 1);

    eventually(&pool, "replacement", |s| s.recoveries == 1 && s.available_workers == 2).await;
    assert_eq!(spawner.spawn_count(), 3);
    assert_eq!(pool.status(), PoolStatus::Ready);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let config = PoolConfig {
        pool_size: 0,
        ..test_config(1)
    };
    let result = WorkerPool::start(config, ScriptedSpawner::healthy(), fallback).await;
    assert!(result.is_err());
}

// ── Recovery and health ─────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn crashed_worker_is_recovered() {
    // The first incarnation of worker 0 crashes on its first job.
    let spawner = ScriptedSpawner::new(|worker_id, seq| Script {
        crash_on_count: worker_id == 0 && seq == 0,
        ..Script::default()
    });
    let pool = start(test_config(1), &spawner).await;

    let text = "doomed job";
    assert_eq!(pool.submit(text, SubmitOptions::new()).await, Ok(fallback(text)));

    eventually(&pool, "recovery", |s| s.recoveries == 1 && s.available_workers == 1).await;
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(pool.submit("after recovery", SubmitOptions::new()).await, Ok(2));
}

#[test_log::test(tokio::test)]
async fn total_failure_degrades_to_fallback() {
    let config = PoolConfig {
        max_failures_in_window: 2,
        ..test_config(2)
    };
    // Original workers crash on their first job; every replacement crashes
    // right after reporting ready.
    let spawner = ScriptedSpawner::new(|_, seq| Script {
        crash_on_count: true,
        crash_after_ready: seq >= 2,
        ..Script::default()
    });
    let pool = start(config, &spawner).await;

    let a = pool.submit("job a", SubmitOptions::new());
    let b = pool.submit("job b", SubmitOptions::new());
    assert_eq!(a.await, Ok(fallback("job a")));
    assert_eq!(b.await, Ok(fallback("job b")));

    eventually(&pool, "retirement", |s| s.permanently_failed_workers == 2).await;

    let text = "after total failure";
    assert_eq!(pool.submit(text, SubmitOptions::new()).await, Ok(fallback(text)));
    let stats = pool.stats();
    assert_eq!(stats.available_workers, 0);
    assert!(!stats.accepting_jobs);
    assert_eq!(stats.status, PoolStatus::Failed);
}

#[test_log::test(tokio::test)]
async fn mixed_failures_still_reach_total_degradation() {
    let config = PoolConfig {
        max_failures_in_window: 2,
        ..test_config(2)
    };
    // Worker 1 always rejects INIT. Worker 0 crashes on its first job and
    // every replacement crashes right after reporting ready.
    let spawner = ScriptedSpawner::new(|worker_id, seq| Script {
        reject_init: worker_id == 1,
        crash_on_count: worker_id == 0,
        crash_after_ready: worker_id == 0 && seq >= 2,
        ..Script::default()
    });
    let pool = start(config, &spawner).await;

    assert_eq!(pool.submit("job a", SubmitOptions::new()).await, Ok(fallback("job a")));
    eventually(&pool, "retirement", |s| s.permanently_failed_workers == 2).await;

    let text = "after every worker is gone";
    let count = timeout(TEST_TIMEOUT, pool.submit(text, SubmitOptions::new()))
        .await
        .expect("submit must not hang once no worker can serve");
    assert_eq!(count, Ok(fallback(text)));

    let stats = pool.stats();
    assert!(!stats.accepting_jobs);
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.available_workers, 0);
    assert_eq!(stats.status, PoolStatus::Failed);
}

#[tokio::test]
async fn unhealthy_worker_is_replaced() {
    let spawner = ScriptedSpawner::new(|worker_id, seq| Script {
        unhealthy: worker_id == 0 && seq == 0,
        ..Script::default()
    });
    let pool = start(test_config(2), &spawner).await;

    let report = pool.check_health().await;
    assert_eq!(report.probed, 2);
    assert_eq!(report.healthy, 1);
    assert_eq!(report.unhealthy, vec![0]);

    eventually(&pool, "recovery", |s| s.recoveries == 1 && s.available_workers == 2).await;
    assert_eq!(spawner.spawn_count(), 3);
    assert_eq!(pool.status(), PoolStatus::Ready);
}

#[tokio::test]
async fn silent_worker_fails_health_check() {
    let spawner = ScriptedSpawner::new(|_, seq| Script {
        silent_health: seq == 0,
        ..Script::default()
    });
    let pool = start(test_config(1), &spawner).await;

    let report = pool.check_health().await;
    assert_eq!(report.unhealthy, vec![0]);
    eventually(&pool, "recovery", |s| s.recoveries == 1).await;
}

// ── Recycling and teardown ──────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn concurrent_recycles_reinitialize_once() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;
    assert_eq!(pool.submit("warm up", SubmitOptions::new()).await, Ok(2));

    let (first, second) = tokio::join!(pool.recycle(), pool.recycle());
    let outcomes = [first, second];
    let recycled = outcomes
        .iter()
        .filter(|o| matches!(o, RecycleOutcome::Recycled(_)))
        .count();
    assert_eq!(recycled, 1);
    assert!(outcomes.contains(&RecycleOutcome::Coalesced));

    assert_eq!(spawner.spawn_count(), 4);
    assert_eq!(pool.status(), PoolStatus::Ready);
    let stats = pool.stats();
    assert_eq!(stats.recycles, 1);
    assert!(stats.last_recycled_at.is_some());
    assert_eq!(pool.submit("after recycle", SubmitOptions::new()).await, Ok(2));
}

#[tokio::test]
async fn recycle_drains_queue_with_fallback() {
    let spawner = ScriptedSpawner::healthy();
    let mut config = test_config(1);
    config.recycle.drain_stable_checks = 50;
    let pool = start(config, &spawner).await;

    let active = pool.submit("sleep:50 in flight", SubmitOptions::new());
    let queued = pool.submit("waiting in queue", SubmitOptions::new());

    let outcome = pool.recycle().await;
    assert!(matches!(outcome, RecycleOutcome::Recycled(report) if report.initialized == 1));
    assert_eq!(queued.await, Ok(fallback("waiting in queue")));
    assert_eq!(active.await, Ok(3));
    assert_eq!(spawner.dispatch_count("waiting in queue"), 0);
}

#[tokio::test]
async fn memory_pressure_triggers_recycle() {
    let spawner = ScriptedSpawner::healthy();
    let mut config = test_config(1);
    config.recycle.memory_threshold_bytes = Some(1_000);
    let pool = start(config, &spawner).await;

    assert_eq!(pool.report_memory_usage(10).await, None);
    let outcome = pool.report_memory_usage(5_000).await;
    assert!(matches!(outcome, Some(RecycleOutcome::Recycled(_))));
    assert_eq!(spawner.spawn_count(), 2);
}

#[tokio::test]
async fn idle_pool_recycles_itself() {
    let spawner = ScriptedSpawner::healthy();
    let mut config = test_config(1);
    config.health_check_interval = Duration::from_millis(50);
    config.recycle.idle_after = Some(Duration::from_millis(50));
    let pool = start(config, &spawner).await;

    // Nothing has run yet, so an idle pool is left alone.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.stats().recycles, 0);

    assert_eq!(pool.submit("some work", SubmitOptions::new()).await, Ok(2));
    eventually(&pool, "idle recycle", |s| s.recycles == 1).await;
}

#[tokio::test]
async fn terminate_rejects_pending_and_degrades() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(1), &spawner).await;

    let active = pool.submit("sleep:200 active", SubmitOptions::new());
    let queued = pool.submit("queued job", SubmitOptions::new());
    pool.terminate();
    pool.terminate();

    assert_eq!(active.await.unwrap_err().reason(), CancelReason::PoolTerminated);
    assert_eq!(queued.await.unwrap_err().reason(), CancelReason::PoolTerminated);

    let text = "after terminate";
    assert_eq!(pool.submit(text, SubmitOptions::new()).await, Ok(fallback(text)));
    assert_eq!(pool.status(), PoolStatus::Terminated);
    assert_eq!(pool.recycle().await, RecycleOutcome::Skipped);
}

// ── Batches ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn small_batch_preserves_order() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;

    let texts = vec!["a".to_string(), "a b c".to_string(), "a b".to_string()];
    let counts = pool.submit_batch(texts, SubmitOptions::new()).await.unwrap();
    assert_eq!(counts, vec![1, 3, 2]);
    assert!(pool.submit_batch(Vec::new(), SubmitOptions::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn large_batch_is_chunked_in_order() {
    let spawner = ScriptedSpawner::healthy();
    let pool = start(test_config(2), &spawner).await;

    let texts: Vec<String> = (1..=11)
        .map(|n| vec!["w"; n].join(" "))
        .collect();
    let counts = pool.submit_batch(texts.clone(), SubmitOptions::new()).await.unwrap();
    assert_eq!(counts, (1..=11).collect::<Vec<_>>());

    // Two chunks, one batch request each.
    assert_eq!(pool.stats().processed, 2);
    let mut dispatched = spawner.dispatched();
    dispatched.sort();
    let mut expected = texts;
    expected.sort();
    assert_eq!(dispatched, expected);
}

// ── Real transports ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thread_workers_count_end_to_end() {
    let pool = WorkerPool::start(
        test_config(2),
        ThreadSpawner::new(|| HeuristicTokenizer),
        CharRatioEstimator::default(),
    )
    .await
    .unwrap();

    assert_eq!(pool.init_report().initialized, 2);
    let count = timeout(TEST_TIMEOUT, pool.submit("Hello, world!", SubmitOptions::new()))
        .await
        .unwrap();
    assert_eq!(count, Ok(6));

    let texts = (0..10).map(|i| format!("item number {i}")).collect();
    let counts = pool.submit_batch(texts, SubmitOptions::new()).await.unwrap();
    assert_eq!(counts.len(), 10);
    // "item" + "number" (two pieces) + the digit.
    assert!(counts.iter().all(|&c| c == 4));
    assert_eq!(pool.stats().worker_fallbacks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_workers_count_end_to_end() {
    let config = PoolConfig {
        ready_timeout: Duration::from_secs(5),
        init_timeout: Duration::from_secs(5),
        ..test_config(1)
    };
    let spawner = ProcessSpawner::new(env!("CARGO_BIN_EXE_token-pool")).arg("--worker");
    let pool = WorkerPool::start(config, spawner, CharRatioEstimator::default())
        .await
        .unwrap();

    assert_eq!(pool.init_report().initialized, 1);
    let count = timeout(TEST_TIMEOUT, pool.submit("Hello, world!", SubmitOptions::new()))
        .await
        .unwrap();
    assert_eq!(count, Ok(6));
    pool.terminate();
}
