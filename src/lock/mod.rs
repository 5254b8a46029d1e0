//! Strategies for claiming the next pending job.
//!
//! Every strategy picks the oldest pending job of one queue (by `created_at`,
//! then `id`) and moves it to processing, such that two concurrent callers
//! never get the same job. They differ in the primitive used to resolve
//! contention, so the right one depends on what the database supports.
//!
//! All workers sharing a table must use the same strategy.

mod advisory;
mod compare_and_set;
mod skip_locked;

pub use self::advisory::AdvisoryLock;
pub use self::compare_and_set::CompareAndSet;
pub use self::skip_locked::SkipLocked;

use crate::errors::QueueError;
use crate::schema::JobTable;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// First PostgreSQL release with `FOR UPDATE SKIP LOCKED` (9.5).
const SKIP_LOCKED_MIN_VERSION: i32 = 90_500;

/// Claims one pending job of a queue.
pub trait ClaimStrategy: fmt::Debug + Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> LockingStrategy;

    /// Move the oldest pending job of `queue` to processing and return its id.
    ///
    /// Returns `Ok(None)` when there is nothing to claim.
    fn claim<'a>(
        &'a self,
        pool: &'a PgPool,
        table: &'a JobTable,
        queue: &'a str,
    ) -> BoxFuture<'a, Result<Option<Uuid>, QueueError>>;
}

/// Configured choice of [`ClaimStrategy`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockingStrategy {
    /// Detect the best strategy from the server's capabilities
    #[default]
    Auto,
    /// Row locks that skip rows locked by other transactions
    SkipLocked,
    /// A transaction-scoped advisory lock per queue
    AdvisoryLock,
    /// A guarded update, retried when another worker wins the race
    CompareAndSet,
}

impl LockingStrategy {
    /// Replace [`LockingStrategy::Auto`] with the strategy the server supports
    /// best. Explicit choices are returned unchanged.
    #[instrument(name = "jobs.detect_locking", skip(pool))]
    pub async fn resolve(self, pool: &PgPool) -> Result<Self, QueueError> {
        if self != Self::Auto {
            return Ok(self);
        }

        let capabilities = BackendCapabilities::detect(pool).await?;
        let strategy = capabilities.preferred_strategy();
        debug!(?capabilities, %strategy, "Detected locking strategy");
        Ok(strategy)
    }

    /// Build the strategy.
    ///
    /// An unresolved [`LockingStrategy::Auto`] builds the portable
    /// compare-and-set strategy.
    pub fn build(self, claim_retries: u32) -> Arc<dyn ClaimStrategy> {
        match self {
            Self::SkipLocked => Arc::new(SkipLocked),
            Self::AdvisoryLock => Arc::new(AdvisoryLock),
            Self::Auto | Self::CompareAndSet => Arc::new(CompareAndSet::new(claim_retries)),
        }
    }
}

/// What the connected server offers for claiming rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// `server_version_num` as reported by the server, e.g. `160002`
    pub server_version_num: i32,
    /// Whether `pg_advisory_xact_lock` is available
    pub advisory_locks: bool,
}

impl BackendCapabilities {
    /// Ask the server what it supports.
    pub async fn detect(pool: &PgPool) -> Result<Self, QueueError> {
        let server_version_num =
            sqlx::query_scalar::<_, i32>("SELECT current_setting('server_version_num')::INTEGER")
                .fetch_one(pool)
                .await?;

        let advisory_locks = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_proc WHERE proname = 'pg_advisory_xact_lock')",
        )
        .fetch_one(pool)
        .await?;

        Ok(Self {
            server_version_num,
            advisory_locks,
        })
    }

    /// The cheapest strategy these capabilities allow.
    pub fn preferred_strategy(&self) -> LockingStrategy {
        if self.server_version_num >= SKIP_LOCKED_MIN_VERSION {
            LockingStrategy::SkipLocked
        } else if self.advisory_locks {
            LockingStrategy::AdvisoryLock
        } else {
            LockingStrategy::CompareAndSet
        }
    }
}
