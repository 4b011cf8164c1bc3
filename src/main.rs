use std::io::{BufRead, Write};

use anyhow::Context;
use token_pool::worker::{HeuristicTokenizer, ProcessSpawner, ThreadSpawner, serve_stdio};
use token_pool::{CharRatioEstimator, PoolConfig, SubmitOptions, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries results (or the worker protocol), so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if std::env::args().any(|arg| arg == "--worker") {
        // Blocking stdio loop; keep it off the async workers.
        tokio::task::spawn_blocking(|| serve_stdio(HeuristicTokenizer))
            .await
            .context("worker loop panicked")??;
        return Ok(());
    }

    let config = PoolConfig::from_env().context("invalid pool configuration")?;
    let mode = std::env::var("TOKEN_POOL_WORKER_MODE").unwrap_or_else(|_| "thread".to_string());

    eprintln!("🧮 Token Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {} ({} mode)", config.pool_size, mode);
    eprintln!("   Queue: {} jobs, timeout {:?}", config.max_queue_size, config.job_timeout);

    let estimator = CharRatioEstimator::default();
    let pool = match mode.as_str() {
        "thread" => {
            WorkerPool::start(config, ThreadSpawner::new(|| HeuristicTokenizer), estimator).await?
        }
        "process" => {
            let exe = std::env::current_exe().context("cannot locate own executable")?;
            WorkerPool::start(config, ProcessSpawner::new(exe).arg("--worker"), estimator).await?
        }
        other => anyhow::bail!("unknown TOKEN_POOL_WORKER_MODE: {other} (expected thread or process)"),
    };

    let texts = tokio::task::spawn_blocking(|| {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<Result<Vec<String>, _>>()
    })
    .await
    .context("stdin reader panicked")?
    .context("failed to read stdin")?;

    let counts = pool.submit_batch(texts, SubmitOptions::new()).await?;

    let mut stdout = std::io::stdout().lock();
    for count in counts {
        writeln!(stdout, "{count}")?;
    }
    stdout.flush()?;

    eprintln!("{}", serde_json::to_string_pretty(&pool.stats())?);
    pool.terminate();
    Ok(())
}
