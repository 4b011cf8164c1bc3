//! The public face of the pool.

use std::sync::Arc;

use futures::future::{self, BoxFuture, try_join_all};
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::{ConfigError, JobError};
use crate::estimator::FallbackEstimator;
use crate::pool::health::HealthReport;
use crate::pool::job::SubmitOptions;
use crate::pool::lifecycle::InitReport;
use crate::pool::recycle::{RecycleOutcome, RecycleTrigger};
use crate::pool::scheduler::PoolInner;
use crate::pool::stats::{PoolStats, PoolStatus};
use crate::worker::WorkerSpawner;

/// A resilient pool of token-counting workers.
///
/// `submit` never fails for infrastructure reasons: oversized input, a full
/// queue, a timeout, a crashed worker or a pool without workers all degrade
/// to the fallback estimator. The only error a caller sees is cancellation.
///
/// The pool is an owned value. Dropping it terminates it; share it with
/// `Arc<WorkerPool>`.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    monitor: JoinHandle<()>,
    init_report: InitReport,
}

impl WorkerPool {
    /// Validate `config`, spawn the workers, run the startup handshake and
    /// start the health monitor.
    pub async fn start<S, E>(config: PoolConfig, spawner: S, estimator: E) -> Result<Self, ConfigError>
    where
        S: WorkerSpawner,
        E: FallbackEstimator + 'static,
    {
        config.validate()?;
        tracing::info!(
            pool_size = config.pool_size,
            max_queue = config.max_queue_size,
            "Starting worker pool"
        );
        let inner = PoolInner::new(config, Arc::new(spawner), Arc::new(estimator));
        let init_report = inner.initialize_workers().await;
        let monitor = inner.spawn_health_monitor();
        Ok(Self {
            inner,
            monitor,
            init_report,
        })
    }

    /// Count tokens in `text`.
    ///
    /// The request is admitted (dispatched, queued, deduplicated or
    /// estimated) before this returns; the future only waits for the result.
    pub fn submit(
        &self,
        text: impl Into<String>,
        options: SubmitOptions,
    ) -> BoxFuture<'static, Result<usize, JobError>> {
        self.inner.admit_count(text.into(), options)
    }

    /// Count tokens in each text, preserving input order.
    ///
    /// Small batches (at most twice the pool size) go through `submit` item
    /// by item. Larger ones are split into `pool_size` contiguous chunks,
    /// each sent to a worker as one batch request.
    pub fn submit_batch(
        &self,
        texts: Vec<String>,
        options: SubmitOptions,
    ) -> BoxFuture<'static, Result<Vec<usize>, JobError>> {
        if texts.is_empty() {
            return future::ready(Ok(Vec::new())).boxed();
        }
        let pool_size = self.inner.config.pool_size;

        if texts.len() <= pool_size * 2 {
            let items: Vec<_> = texts
                .into_iter()
                .map(|text| self.submit(text, options.clone()))
                .collect();
            return try_join_all(items).boxed();
        }

        let chunk_size = texts.len().div_ceil(pool_size);
        let mut remaining = texts.into_iter();
        let mut chunks = Vec::with_capacity(pool_size);
        loop {
            let chunk: Vec<String> = remaining.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            chunks.push(self.inner.admit_batch(chunk, options.clone()));
        }
        async move {
            let parts = try_join_all(chunks).await?;
            Ok(parts.into_iter().flatten().collect())
        }
        .boxed()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().snapshot()
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.state.lock().status()
    }

    /// Outcome of the startup handshake.
    pub fn init_report(&self) -> InitReport {
        self.init_report
    }

    /// Stop the pool. Pending requests are rejected with a cancellation
    /// error; later submissions are served by the fallback estimator.
    /// Idempotent.
    pub fn terminate(&self) {
        self.inner.terminate();
        self.monitor.abort();
    }

    /// Drain and reinitialize every worker.
    pub async fn recycle(&self) -> RecycleOutcome {
        self.inner.recycle(RecycleTrigger::Manual).await
    }

    /// Report current memory usage; recycles when it reaches
    /// `recycle.memory_threshold_bytes`. Returns `None` if no recycle ran.
    pub async fn report_memory_usage(&self, bytes: u64) -> Option<RecycleOutcome> {
        self.inner.on_memory_usage(bytes).await
    }

    /// Run one health sweep now.
    pub async fn check_health(&self) -> HealthReport {
        self.inner.run_health_check().await
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pool_size", &self.inner.config.pool_size)
            .field("status", &self.status())
            .finish()
    }
}
