//! The seam between the pool and a worker execution context.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::WorkerError;
use crate::protocol::{PoolMessage, WorkerMessage};

/// Something that happened on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A protocol message.
    Message(WorkerMessage),
    /// The worker died or raised an unrecoverable error.
    Crashed { reason: String },
}

/// Hook that forcibly stops a worker (kill a process, flag a thread).
pub type Terminator = Box<dyn FnOnce() + Send>;

/// Channels to a freshly spawned worker.
///
/// Closing the event channel counts as a crash.
pub struct WorkerConnection {
    outbox: mpsc::UnboundedSender<PoolMessage>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    terminator: Option<Terminator>,
}

impl WorkerConnection {
    pub fn new(
        outbox: mpsc::UnboundedSender<PoolMessage>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Self {
        Self {
            outbox,
            events,
            terminator: None,
        }
    }

    /// Attach a hook that runs when the pool tears the worker down.
    pub fn with_terminator(mut self, terminator: impl FnOnce() + Send + 'static) -> Self {
        self.terminator = Some(Box::new(terminator));
        self
    }

    /// Tear down a connection that was never attached to a slot.
    pub(crate) fn close(self) {
        let _ = self.outbox.send(PoolMessage::Exit);
        if let Some(terminate) = self.terminator {
            terminate();
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<PoolMessage>,
        mpsc::UnboundedReceiver<WorkerEvent>,
        Option<Terminator>,
    ) {
        (self.outbox, self.events, self.terminator)
    }
}

/// Creates worker execution contexts.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Spawn the worker for slot `worker_id`. The worker must send
    /// `WORKER_READY` once it is alive.
    fn spawn(&self, worker_id: usize) -> Result<WorkerConnection, WorkerError>;
}

/// Pool-owned handle to a live worker.
pub(crate) struct WorkerHandle {
    outbox: mpsc::UnboundedSender<PoolMessage>,
    listener: JoinHandle<()>,
    terminator: Option<Terminator>,
}

impl WorkerHandle {
    pub(crate) fn new(
        outbox: mpsc::UnboundedSender<PoolMessage>,
        listener: JoinHandle<()>,
        terminator: Option<Terminator>,
    ) -> Self {
        Self {
            outbox,
            listener,
            terminator,
        }
    }

    /// Send a message. Returns false if the worker is gone.
    pub(crate) fn send(&self, message: PoolMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    /// Detach the event listener, ask the worker to exit, then terminate it.
    pub(crate) fn shutdown(mut self) {
        self.listener.abort();
        let _ = self.outbox.send(PoolMessage::Exit);
        if let Some(terminate) = self.terminator.take() {
            terminate();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("closed", &self.outbox.is_closed())
            .field("terminator", &self.terminator.is_some())
            .finish()
    }
}
