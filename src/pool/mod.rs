//! The worker pool: admission, dispatch, recovery, health and recycling.

mod dedup;
mod health;
mod job;
mod lifecycle;
mod orchestrator;
mod queue;
mod recovery;
mod recycle;
mod scheduler;
mod stats;

pub use dedup::Fingerprint;
pub use health::HealthReport;
pub use job::{JobOutput, JobPayload, SubmitOptions};
pub use lifecycle::InitReport;
pub use orchestrator::WorkerPool;
pub use recovery::RecoveryOutcome;
pub use recycle::{RecycleOutcome, RecycleTrigger};
pub use stats::{PoolStats, PoolStatus};
