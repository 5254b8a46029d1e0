use crate::config::ConfigError;
use crate::identifier::JobIdentifier;
use thiserror::Error;

/// Errors returned by the queue and the job store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The identifier is not a well-formed UUID.
    #[error("invalid job identifier `{0}`")]
    InvalidIdentifier(String),

    /// No job (or no job eligible for the operation) has this identifier.
    #[error("job {0} not found")]
    MissingJob(JobIdentifier),

    /// A job with this identifier already exists.
    #[error("job {0} already exists")]
    DuplicateIdentifier(JobIdentifier),

    /// The backing store is not configured or cannot be reached.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreUnavailable),

    /// Any other error reported by the backing store.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// The queue configuration is invalid or incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A typed job payload could not be (de)serialized.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether retrying the same call later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Why the backing store could not be used.
#[derive(Debug, Error)]
pub enum StoreUnavailable {
    /// The queue was built without a connection pool.
    #[error("no database is configured for the job queue")]
    NotConfigured,

    /// The connection pool could not reach the database.
    #[error("database is unreachable: {0}")]
    Unreachable(#[source] sqlx::Error),
}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        if is_connectivity_error(&error) {
            Self::StoreUnavailable(StoreUnavailable::Unreachable(error))
        } else {
            Self::Database(error)
        }
    }
}

fn is_connectivity_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Lost race inside the compare-and-set claim. Never leaves the `lock` module.
#[derive(Debug, Error)]
#[error("job was claimed by another worker")]
pub(crate) struct ClaimConflict;
