use crate::config::{ConfigError, QueueConfig};
use crate::errors::{QueueError, StoreUnavailable};
use crate::lock::{ClaimStrategy, LockingStrategy};
use crate::queue::JobQueue;
use crate::storage;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point: owns the connection pool and the configuration, and hands
/// out [`JobQueue`]s.
///
/// The locking strategy is resolved once, when the driver is built, and is
/// shared by every queue created from it.
#[derive(Debug, Clone)]
pub struct JobsDriver {
    pool: Option<PgPool>,
    config: Arc<QueueConfig>,
    strategy: Arc<dyn ClaimStrategy>,
}

impl JobsDriver {
    /// Create a driver on top of an existing pool.
    ///
    /// Without a pool every queue operation fails with
    /// [`StoreUnavailable::NotConfigured`].
    pub async fn new(pool: Option<PgPool>, config: QueueConfig) -> Result<Self, QueueError> {
        let locking = match &pool {
            Some(pool) => config.get_locking().resolve(pool).await?,
            None => config.get_locking(),
        };
        let strategy = locking.build(config.get_claim_retries());

        info!(
            table = %config.get_table(),
            strategy = %strategy.kind(),
            soft_deletes = config.uses_soft_deletes(),
            "Job queue driver ready"
        );

        Ok(Self {
            pool,
            config: Arc::new(config),
            strategy,
        })
    }

    /// Open a pool to the configured database and create a driver on it.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        let pool = {
            let url = config
                .get_database_url()
                .ok_or(ConfigError::MissingDatabaseUrl)?;

            PgPoolOptions::new()
                .max_connections(config.get_max_connections())
                .acquire_timeout(ACQUIRE_TIMEOUT)
                .connect(url)
                .await?
        };

        Self::new(Some(pool), config).await
    }

    /// A handle to the queue called `name`.
    pub fn queue(&self, name: impl Into<String>) -> JobQueue {
        JobQueue {
            pool: self.pool.clone(),
            table: self.config.get_table().clone(),
            name: name.into(),
            soft_deletes: self.config.uses_soft_deletes(),
            strategy: self.strategy.clone(),
        }
    }

    /// The locking strategy in use.
    pub fn locking(&self) -> LockingStrategy {
        self.strategy.kind()
    }

    /// The configuration this driver was built with.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The connection pool, if one is configured.
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Create the job table if it does not exist yet.
    pub async fn setup_database(&self) -> Result<(), QueueError> {
        storage::setup_database(self.configured_pool()?, self.config.get_table()).await
    }

    /// Drop the job table.
    pub async fn drop_database(&self) -> Result<(), QueueError> {
        storage::drop_database(self.configured_pool()?, self.config.get_table()).await
    }

    /// Close the connection pool. Queues created from this driver fail
    /// afterwards.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            info!("Closing job queue connection pool…");
            pool.close().await;
        }
    }

    fn configured_pool(&self) -> Result<&PgPool, QueueError> {
        self.pool
            .as_ref()
            .ok_or(QueueError::StoreUnavailable(StoreUnavailable::NotConfigured))
    }
}
