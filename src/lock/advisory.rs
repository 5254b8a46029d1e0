use super::{ClaimStrategy, LockingStrategy};
use crate::errors::QueueError;
use crate::schema::JobTable;
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use uuid::Uuid;

/// Claims under a transaction-scoped advisory lock keyed by table and queue.
///
/// Claims for the same queue are serialized; the lock is released when the
/// transaction ends, including on rollback.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdvisoryLock;

impl ClaimStrategy for AdvisoryLock {
    fn kind(&self) -> LockingStrategy {
        LockingStrategy::AdvisoryLock
    }

    fn claim<'a>(
        &'a self,
        pool: &'a PgPool,
        table: &'a JobTable,
        queue: &'a str,
    ) -> BoxFuture<'a, Result<Option<Uuid>, QueueError>> {
        async move {
            let mut tx = pool.begin().await?;

            // Hashed server-side so every worker derives the same key.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(table.lock_key(queue))
                .execute(&mut *tx)
                .await?;

            let Some(id) = storage::find_next_pending(&mut *tx, table, queue, "").await? else {
                tx.rollback().await?;
                return Ok(None);
            };

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
