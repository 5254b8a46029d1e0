use super::{ClaimStrategy, LockingStrategy};
use crate::errors::QueueError;
use crate::schema::JobTable;
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use uuid::Uuid;

/// Claims with `SELECT … FOR UPDATE SKIP LOCKED`.
///
/// Concurrent claimers never wait for each other: a row locked by another
/// transaction is skipped and the next oldest one is taken instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipLocked;

impl ClaimStrategy for SkipLocked {
    fn kind(&self) -> LockingStrategy {
        LockingStrategy::SkipLocked
    }

    fn claim<'a>(
        &'a self,
        pool: &'a PgPool,
        table: &'a JobTable,
        queue: &'a str,
    ) -> BoxFuture<'a, Result<Option<Uuid>, QueueError>> {
        async move {
            let mut tx = pool.begin().await?;

            let next =
                storage::find_next_pending(&mut *tx, table, queue, "FOR UPDATE SKIP LOCKED").await?;
            let Some(id) = next else {
                tx.rollback().await?;
                return Ok(None);
            };

            // Row locked until commit; only a rejecting trigger makes this miss.
            if !storage::mark_processing(&mut *tx, table, id).await? {
                tx.rollback().await?;
                return Ok(None);
            }
            tx.commit().await?;

            Ok(Some(id))
        }
        .boxed()
    }
}
