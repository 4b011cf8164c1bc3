//! Token Pool: a resilient worker pool for offloading token counting.

pub mod config;
pub mod error;
pub mod estimator;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use config::{PoolConfig, RecycleConfig};
pub use error::{CancelReason, Error, JobError};
pub use estimator::{CharRatioEstimator, FallbackEstimator};
pub use pool::{PoolStats, PoolStatus, SubmitOptions, WorkerPool};
