#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_matches, assert_none, assert_some, assert_some_eq};
use pg_jobs::{JobData, JobIdentifier, JobsDriver, LockingStrategy, QueueConfig, QueueError};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashSet;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

const STRATEGIES: [LockingStrategy; 3] = [
    LockingStrategy::SkipLocked,
    LockingStrategy::AdvisoryLock,
    LockingStrategy::CompareAndSet,
];

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        // Enough connections for every concurrent claimer to hold a transaction
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(&connection_string)
            .await?;

        Ok((pool, container))
    }

    /// Create a driver with its own table, so strategies do not share jobs
    pub(super) async fn create_driver(
        pool: &PgPool,
        strategy: LockingStrategy,
    ) -> anyhow::Result<JobsDriver> {
        let config = QueueConfig::default()
            .locking(strategy)
            .table(&format!("claims_{strategy}"))?;
        let driver = JobsDriver::new(Some(pool.clone()), config).await?;
        driver.setup_database().await?;
        Ok(driver)
    }

    pub(super) async fn enqueue(driver: &JobsDriver, count: usize) -> anyhow::Result<Vec<JobIdentifier>> {
        let queue = driver.queue("default");
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = JobIdentifier::generate();
            queue.set(&id, &JobData::new("test", json!({ "n": i }))).await?;
            ids.push(id);
        }
        Ok(ids)
    }
}

#[tokio::test]
async fn auto_detection_picks_skip_locked_on_modern_postgres() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let driver = JobsDriver::new(Some(pool.clone()), QueueConfig::default()).await?;
    assert_eq!(driver.locking(), LockingStrategy::SkipLocked);

    let capabilities = pg_jobs::lock::BackendCapabilities::detect(&pool).await?;
    assert!(capabilities.advisory_locks);
    assert!(capabilities.server_version_num >= 90_500);

    Ok(())
}

#[tokio::test]
async fn concurrent_pops_never_claim_the_same_job() -> anyhow::Result<()> {
    const JOBS: usize = 60;
    const WORKERS: usize = 8;

    let (pool, _container) = test_utils::setup_test_db().await?;

    for strategy in STRATEGIES {
        let driver = test_utils::create_driver(&pool, strategy).await?;
        let enqueued = test_utils::enqueue(&driver, JOBS).await?;

        let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(WORKERS));
        let handles = (0..WORKERS)
            .map(|_| {
                let queue = driver.queue("default");
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let mut claimed = Vec::new();
                    while let Some(id) = queue.pop().await? {
                        claimed.push(id);
                    }
                    Ok::<_, QueueError>(claimed)
                })
            })
            .collect::<Vec<_>>();

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await??);
        }

        // A compare-and-set poll may give up after losing too many races, so
        // drain whatever is left sequentially.
        let queue = driver.queue("default");
        while let Some(id) = queue.pop().await? {
            claimed.push(id);
        }

        let unique = claimed.iter().cloned().collect::<HashSet<_>>();
        assert_eq!(unique.len(), claimed.len(), "{strategy} handed out a job twice");
        assert_eq!(unique, enqueued.into_iter().collect(), "{strategy} lost jobs");
    }

    Ok(())
}

#[tokio::test]
async fn skip_locked_claims_past_a_locked_row_without_waiting() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let driver = test_utils::create_driver(&pool, LockingStrategy::SkipLocked).await?;
    let ids = test_utils::enqueue(&driver, 2).await?;

    // Someone else holds a row lock on the oldest job
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT id FROM claims_skip_locked WHERE id = $1 FOR UPDATE")
        .bind(ids[0].to_uuid()?)
        .execute(&mut *tx)
        .await?;

    let queue = driver.queue("default");
    let claimed = tokio::time::timeout(Duration::from_secs(5), queue.pop()).await??;
    assert_some_eq!(claimed, ids[1].clone());
    assert_none!(tokio::time::timeout(Duration::from_secs(5), queue.pop()).await??);

    tx.rollback().await?;
    assert_some_eq!(queue.pop().await?, ids[0].clone());

    Ok(())
}

#[tokio::test]
async fn advisory_lock_serializes_claims_per_queue() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let driver = test_utils::create_driver(&pool, LockingStrategy::AdvisoryLock).await?;
    let ids = test_utils::enqueue(&driver, 1).await?;

    // Hold the lock a claimer of this queue would take
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('claims_advisory_lock:default'))")
        .execute(&mut *tx)
        .await?;

    let queue = driver.queue("default");
    let claim = tokio::spawn(async move { queue.pop().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!claim.is_finished(), "claim did not wait for the advisory lock");

    // Other queues are not affected
    let other = driver.queue("other");
    assert_none!(tokio::time::timeout(Duration::from_secs(5), other.pop()).await??);

    tx.commit().await?;
    assert_some_eq!(claim.await??, ids[0].clone());

    Ok(())
}

#[tokio::test]
async fn failed_claims_leave_the_job_pending() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    for strategy in STRATEGIES {
        let driver = test_utils::create_driver(&pool, strategy).await?;
        let table = format!("claims_{strategy}");
        let ids = test_utils::enqueue(&driver, 1).await?;

        // Make the transition to `processing` fail after the row was selected
        sqlx::query(
            "CREATE OR REPLACE FUNCTION reject_claims() RETURNS trigger AS $$
             BEGIN
                 RAISE EXCEPTION 'claims are disabled';
             END;
             $$ LANGUAGE plpgsql",
        )
        .execute(&pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TRIGGER reject_claims BEFORE UPDATE ON {table}
             FOR EACH ROW WHEN (NEW.state = 'processing') EXECUTE FUNCTION reject_claims()"
        ))
        .execute(&pool)
        .await?;

        let queue = driver.queue("default");
        assert_matches!(queue.pop().await, Err(QueueError::Database(_)));

        let state = sqlx::query_scalar::<_, String>(&format!("SELECT state FROM {table} WHERE id = $1"))
            .bind(ids[0].to_uuid()?)
            .fetch_one(&pool)
            .await?;
        assert_eq!(state, "pending", "{strategy} left the job in {state}");

        sqlx::query(&format!("DROP TRIGGER reject_claims ON {table}"))
            .execute(&pool)
            .await?;
        let claimed = assert_some!(queue.pop().await?);
        assert_eq!(claimed, ids[0]);
    }

    Ok(())
}

#[tokio::test]
async fn claims_that_update_nothing_return_none() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    // Silently drops the transition, like a row retired between select and update
    sqlx::query(
        "CREATE OR REPLACE FUNCTION skip_claims() RETURNS trigger AS $$
         BEGIN
             RETURN NULL;
         END;
         $$ LANGUAGE plpgsql",
    )
    .execute(&pool)
    .await?;

    for strategy in STRATEGIES {
        let driver = test_utils::create_driver(&pool, strategy).await?;
        let table = format!("claims_{strategy}");
        let ids = test_utils::enqueue(&driver, 1).await?;

        sqlx::query(&format!(
            "CREATE TRIGGER skip_claims BEFORE UPDATE ON {table}
             FOR EACH ROW WHEN (NEW.state = 'processing') EXECUTE FUNCTION skip_claims()"
        ))
        .execute(&pool)
        .await?;

        let queue = driver.queue("default");
        assert_none!(queue.pop().await?, "{strategy} reported a claim it did not make");

        sqlx::query(&format!("DROP TRIGGER skip_claims ON {table}"))
            .execute(&pool)
            .await?;
        assert_some_eq!(queue.pop().await?, ids[0].clone());
    }

    Ok(())
}
