//! Worker-side execution: the protocol loop that runs inside each worker,
//! and the spawners that host it on OS threads or child processes.

use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, WorkerError};
use crate::estimator::{CharRatioEstimator, FallbackEstimator};
use crate::protocol::{PoolMessage, RequestId, WorkerMessage};
use crate::worker::handle::{WorkerConnection, WorkerEvent, WorkerSpawner};

/// The precise counting algorithm executed inside a worker.
pub trait Tokenizer: Send + 'static {
    /// Heavy one-time setup (loading vocabularies, compiling a runtime, ...).
    fn initialize(&mut self) -> Result<(), String>;

    /// Count tokens in `text`.
    fn count(&self, text: &str) -> usize;
}

/// Stand-in tokenizer: words and punctuation, with long words split every
/// four characters.
#[derive(Debug, Clone, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn initialize(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn count(&self, text: &str) -> usize {
        let mut tokens = 0;
        let mut word_len = 0usize;
        for ch in text.chars() {
            if ch.is_alphanumeric() {
                word_len += 1;
                continue;
            }
            tokens += word_len.div_ceil(4);
            word_len = 0;
            if !ch.is_whitespace() {
                tokens += 1;
            }
        }
        tokens + word_len.div_ceil(4)
    }
}

/// Protocol state machine of a single worker.
pub struct WorkerRuntime<T> {
    tokenizer: T,
    initialized: bool,
    fallback: CharRatioEstimator,
}

impl<T: Tokenizer> WorkerRuntime<T> {
    pub fn new(tokenizer: T) -> Self {
        Self {
            tokenizer,
            initialized: false,
            fallback: CharRatioEstimator::default(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Handle one request. Returns `None` when the worker should exit.
    pub fn handle(&mut self, message: PoolMessage) -> Option<WorkerMessage> {
        match message {
            PoolMessage::Init { id } => {
                let success = match self.tokenizer.initialize() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "Tokenizer initialization failed");
                        false
                    }
                };
                self.initialized = success;
                Some(WorkerMessage::InitComplete { id, success })
            }
            PoolMessage::Count { id, payload } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.count_text(&payload)));
                Some(match outcome {
                    Ok((result, fallback)) => WorkerMessage::Result {
                        id,
                        result,
                        fallback,
                    },
                    Err(panic) => job_error(id, &*panic),
                })
            }
            PoolMessage::BatchCount { id, payload } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut degraded = false;
                    let counts = payload
                        .iter()
                        .map(|text| {
                            let (count, fallback) = self.count_text(text);
                            degraded |= fallback;
                            count
                        })
                        .collect::<Vec<_>>();
                    (counts, degraded)
                }));
                Some(match outcome {
                    Ok((result, fallback)) => WorkerMessage::BatchResult {
                        id,
                        result,
                        fallback,
                    },
                    Err(panic) => job_error(id, &*panic),
                })
            }
            PoolMessage::HealthCheck { id } => Some(WorkerMessage::HealthResponse { id, healthy: true }),
            PoolMessage::Exit => None,
        }
    }

    fn count_text(&self, text: &str) -> (usize, bool) {
        if self.initialized {
            (self.tokenizer.count(text), false)
        } else {
            (self.fallback.estimate(text), true)
        }
    }
}

fn job_error(id: RequestId, panic: &(dyn std::any::Any + Send)) -> WorkerMessage {
    WorkerMessage::Error {
        id,
        error: panic_message(panic),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

// ── Thread workers ─────────────────────────────────────────────────────

/// Hosts each worker on a dedicated OS thread.
pub struct ThreadSpawner<T> {
    factory: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T: Tokenizer> ThreadSpawner<T> {
    /// `factory` builds a fresh tokenizer for every (re)spawned worker.
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl<T: Tokenizer> WorkerSpawner for ThreadSpawner<T> {
    fn spawn(&self, worker_id: usize) -> Result<WorkerConnection, WorkerError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let tokenizer = (self.factory)();

        std::thread::Builder::new()
            .name(format!("token-worker-{worker_id}"))
            .spawn(move || run_thread_worker(worker_id, tokenizer, out_rx, ev_tx))
            .map_err(|e| WorkerError::SpawnFailed {
                id: worker_id,
                reason: e.to_string(),
            })?;

        Ok(WorkerConnection::new(out_tx, ev_rx))
    }
}

fn run_thread_worker<T: Tokenizer>(
    worker_id: usize,
    tokenizer: T,
    mut inbox: mpsc::UnboundedReceiver<PoolMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut runtime = WorkerRuntime::new(tokenizer);
    if events
        .send(WorkerEvent::Message(WorkerMessage::WorkerReady))
        .is_err()
    {
        return;
    }

    while let Some(message) = inbox.blocking_recv() {
        match panic::catch_unwind(AssertUnwindSafe(|| runtime.handle(message))) {
            Ok(Some(reply)) => {
                if events.send(WorkerEvent::Message(reply)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(panic) => {
                let _ = events.send(WorkerEvent::Crashed {
                    reason: panic_message(&*panic),
                });
                break;
            }
        }
    }

    debug!(worker_id, "Worker thread exiting");
}

// ── Process workers ────────────────────────────────────────────────────

/// Hosts each worker in a child process speaking JSON lines on stdio.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a command-line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, worker_id: usize) -> Result<WorkerConnection, WorkerError> {
        let spawn_failed = |reason: String| WorkerError::SpawnFailed {
            id: worker_id,
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout not piped".to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(write_requests(worker_id, stdin, out_rx));
        tokio::spawn(read_responses(worker_id, stdout, ev_tx.clone()));
        tokio::spawn(supervise(worker_id, child, kill_rx, ev_tx));

        debug!(worker_id, program = %self.program.display(), "Spawned worker process");

        Ok(WorkerConnection::new(out_tx, ev_rx).with_terminator(move || {
            let _ = kill_tx.send(());
        }))
    }
}

async fn write_requests(
    worker_id: usize,
    mut stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<PoolMessage>,
) {
    while let Some(message) = requests.recv().await {
        let exit = matches!(message, PoolMessage::Exit);
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to encode worker request");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(worker_id, error = %e, "Worker stdin closed");
            break;
        }
        if stdin.flush().await.is_err() || exit {
            break;
        }
    }
}

async fn read_responses(
    worker_id: usize,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match WorkerMessage::from_line(&line) {
                    Ok(message) => {
                        if events.send(WorkerEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(worker_id, error = %e, "Ignoring malformed worker output"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(WorkerEvent::Crashed {
                    reason: format!("stdout read failed: {e}"),
                });
                break;
            }
        }
    }
}

async fn supervise(
    worker_id: usize,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("worker process exited with {status}"),
                Err(e) => format!("failed to wait for worker process: {e}"),
            };
            let _ = events.send(WorkerEvent::Crashed { reason });
        }
        _ = kill => {
            if let Err(e) = child.kill().await {
                debug!(worker_id, error = %e, "Worker process already gone");
            }
        }
    }
}

// ── Stdio worker entry point ───────────────────────────────────────────

/// Run the worker protocol over this process's stdin/stdout.
pub fn serve_stdio<T: Tokenizer>(tokenizer: T) -> Result<(), Error> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve_lines(tokenizer, stdin.lock(), stdout.lock())
}

/// Run the worker protocol over any line-oriented reader/writer pair.
pub fn serve_lines<T, R, W>(tokenizer: T, reader: R, mut writer: W) -> Result<(), Error>
where
    T: Tokenizer,
    R: BufRead,
    W: Write,
{
    let mut runtime = WorkerRuntime::new(tokenizer);
    write_line(&mut writer, &WorkerMessage::WorkerReady)?;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message = match PoolMessage::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed pool request");
                continue;
            }
        };
        match runtime.handle(message) {
            Some(reply) => write_line(&mut writer, &reply)?,
            None => break,
        }
    }
    Ok(())
}

fn write_line<W: Write>(writer: &mut W, message: &WorkerMessage) -> Result<(), Error> {
    writer.write_all(message.to_line()?.as_bytes())?;
    writer.flush()?;
    Ok(())
}
