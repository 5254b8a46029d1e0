#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod config;
mod driver;
mod errors;
mod identifier;
mod job_registry;
pub mod lock;
mod queue;
mod runner;
/// Database schema definitions.
pub mod schema;
/// Low-level access to the job table.
pub mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, DEFAULT_QUEUE};
/// Queue configuration.
pub use self::config::{ConfigError, QueueConfig};
/// Owns the connection pool and creates queues.
pub use self::driver::JobsDriver;
/// Error types of queue operations.
pub use self::errors::{QueueError, StoreUnavailable};
/// Caller-facing job identifier.
pub use self::identifier::JobIdentifier;
/// The configured claim strategy.
pub use self::lock::LockingStrategy;
/// Operations on one named queue.
pub use self::queue::JobQueue;
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, Queue, RunHandle, Runner, Unconfigured};
/// Row types of the job table.
pub use self::schema::{JobData, JobInfo, JobRecord, JobState};
