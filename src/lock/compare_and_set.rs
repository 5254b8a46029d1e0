use super::{ClaimStrategy, LockingStrategy};
use crate::errors::{ClaimConflict, QueueError};
use crate::schema::JobTable;
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

/// Claims by selecting a candidate without any lock and then updating it only
/// if it is still pending.
///
/// Losing the race to another worker is retried `retries` times before the
/// poll gives up and reports that nothing was claimed.
#[derive(Debug, Clone, Copy)]
pub struct CompareAndSet {
    retries: u32,
}

impl CompareAndSet {
    /// Create the strategy with the given number of retries.
    pub fn new(retries: u32) -> Self {
        Self { retries }
    }

    /// Claim attempts per poll: the first one plus the retries.
    fn attempts(&self) -> u64 {
        u64::from(self.retries) + 1
    }

    async fn try_claim(
        pool: &PgPool,
        table: &JobTable,
        queue: &str,
    ) -> Result<Result<Option<Uuid>, ClaimConflict>, QueueError> {
        let Some(id) = storage::find_next_pending(pool, table, queue, "").await? else {
            return Ok(Ok(None));
        };

        if storage::mark_processing(pool, table, id).await? {
            Ok(Ok(Some(id)))
        } else {
            Ok(Err(ClaimConflict))
        }
    }
}

impl ClaimStrategy for CompareAndSet {
    fn kind(&self) -> LockingStrategy {
        LockingStrategy::CompareAndSet
    }

    fn claim<'a>(
        &'a self,
        pool: &'a PgPool,
        table: &'a JobTable,
        queue: &'a str,
    ) -> BoxFuture<'a, Result<Option<Uuid>, QueueError>> {
        async move {
            for attempt in 0..self.attempts() {
                match Self::try_claim(pool, table, queue).await? {
                    Ok(claimed) => return Ok(claimed),
                    Err(conflict) => debug!(attempt, "{conflict}"),
                }
            }

            debug!("Giving up on this poll after {} conflicts", self.attempts());
            Ok(None)
        }
        .boxed()
    }
}
