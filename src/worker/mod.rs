//! Workers: the execution contexts behind the pool.
//!
//! Core components:
//! - `state`: lifecycle state machine (Spawned → Ready → Initialized, Failed, Retired)
//! - `handle`: the `WorkerSpawner` seam and pool-side worker handles
//! - `runtime`: worker-side protocol loop plus thread and process spawners

pub mod handle;
pub mod runtime;
pub mod state;

pub use handle::{WorkerConnection, WorkerEvent, WorkerSpawner};
pub use runtime::{
    HeuristicTokenizer, ProcessSpawner, ThreadSpawner, Tokenizer, WorkerRuntime, serve_lines,
    serve_stdio,
};
pub use state::{WorkerRecord, WorkerState};
