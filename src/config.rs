use crate::lock::LockingStrategy;
use crate::schema::JobTable;
use serde::Deserialize;
use thiserror::Error;

const ENV_PREFIX: &str = "JOBS_";
const DEFAULT_CLAIM_RETRIES: u32 = 1;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Errors raised while building a [`QueueConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The table name is not a plain SQL identifier.
    #[error("invalid table name `{0}`: expected an identifier, optionally qualified by a schema")]
    InvalidTableName(String),

    /// The environment could not be deserialized into a configuration.
    #[error("failed to read configuration from the environment: {0}")]
    Environment(#[from] envy::Error),

    /// [`JobsDriver::connect`](crate::JobsDriver::connect) needs a database URL.
    #[error("no database URL configured (set JOBS_DATABASE_URL)")]
    MissingDatabaseUrl,
}

/// Settings shared by every queue created from one driver.
///
/// These are fixed for the lifetime of a deployment: workers that disagree on
/// the table or the locking strategy lose the at-most-one-claim guarantee.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    table: JobTable,
    #[serde(default = "default_soft_deletes")]
    soft_deletes: bool,
    #[serde(default)]
    locking: LockingStrategy,
    #[serde(default = "default_claim_retries")]
    claim_retries: u32,
    #[serde(default = "default_max_connections")]
    max_connections: u32,
}

fn default_soft_deletes() -> bool {
    true
}

fn default_claim_retries() -> u32 {
    DEFAULT_CLAIM_RETRIES
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            table: JobTable::default(),
            soft_deletes: default_soft_deletes(),
            locking: LockingStrategy::default(),
            claim_retries: DEFAULT_CLAIM_RETRIES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl QueueConfig {
    /// Load the configuration from `JOBS_*` environment variables.
    ///
    /// A `.env` file in the working directory is read first, if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::prefixed(ENV_PREFIX).from_env()?)
    }

    /// Build a configuration from explicit key/value pairs, using the same
    /// names as [`Self::from_env`].
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
    }

    /// Set the database to connect to.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Set the table the jobs live in.
    pub fn table(mut self, table: &str) -> Result<Self, ConfigError> {
        self.table = JobTable::new(table)?;
        Ok(self)
    }

    /// Keep cleared jobs as completed rows instead of deleting them.
    pub fn soft_deletes(mut self, soft_deletes: bool) -> Self {
        self.soft_deletes = soft_deletes;
        self
    }

    /// Choose how jobs are claimed.
    pub fn locking(mut self, locking: LockingStrategy) -> Self {
        self.locking = locking;
        self
    }

    /// Set how many extra attempts a compare-and-set claim makes after
    /// losing a race.
    pub fn claim_retries(mut self, claim_retries: u32) -> Self {
        self.claim_retries = claim_retries;
        self
    }

    /// Set the size of the connection pool opened by
    /// [`JobsDriver::connect`](crate::JobsDriver::connect).
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// The configured database URL, if any.
    pub fn get_database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    /// The table the jobs live in.
    pub fn get_table(&self) -> &JobTable {
        &self.table
    }

    /// Whether cleared jobs are kept as completed rows.
    pub fn uses_soft_deletes(&self) -> bool {
        self.soft_deletes
    }

    /// The configured locking strategy.
    pub fn get_locking(&self) -> LockingStrategy {
        self.locking
    }

    /// Extra attempts of a compare-and-set claim.
    pub fn get_claim_retries(&self) -> u32 {
        self.claim_retries
    }

    /// Size of the connection pool.
    pub fn get_max_connections(&self) -> u32 {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = QueueConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config.get_database_url(), None);
        assert_eq!(config.get_table(), &JobTable::default());
        assert!(config.uses_soft_deletes());
        assert_eq!(config.get_locking(), LockingStrategy::Auto);
        assert_eq!(config.get_claim_retries(), 1);
        assert_eq!(config.get_max_connections(), 10);
    }

    #[test]
    fn reads_prefixed_variables() {
        let config = QueueConfig::from_vars(vars(&[
            ("JOBS_DATABASE_URL", "postgres://localhost/app"),
            ("JOBS_TABLE", "queue.jobs"),
            ("JOBS_SOFT_DELETES", "false"),
            ("JOBS_LOCKING", "advisory_lock"),
            ("JOBS_CLAIM_RETRIES", "3"),
            ("UNRELATED", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.get_database_url(), Some("postgres://localhost/app"));
        assert_eq!(config.get_table().to_string(), "queue.jobs");
        assert!(!config.uses_soft_deletes());
        assert_eq!(config.get_locking(), LockingStrategy::AdvisoryLock);
        assert_eq!(config.get_claim_retries(), 3);
    }

    #[test]
    fn rejects_bad_values() {
        let error = QueueConfig::from_vars(vars(&[("JOBS_TABLE", "jobs;--")])).unwrap_err();
        assert!(matches!(error, ConfigError::Environment(_)), "{error}");

        let error = QueueConfig::from_vars(vars(&[("JOBS_LOCKING", "optimistic")])).unwrap_err();
        assert!(matches!(error, ConfigError::Environment(_)), "{error}");

        let error = QueueConfig::default().table("1jobs").unwrap_err();
        assert!(matches!(error, ConfigError::InvalidTableName(name) if name == "1jobs"));
    }

    #[test]
    fn builder() {
        let config = QueueConfig::default()
            .database_url("postgres://db/jobs")
            .soft_deletes(false)
            .locking(LockingStrategy::CompareAndSet)
            .claim_retries(0)
            .table("work_items")
            .unwrap();

        assert_eq!(config.get_table().name(), "work_items");
        assert!(!config.uses_soft_deletes());
        assert_eq!(config.get_locking(), LockingStrategy::CompareAndSet);
        assert_eq!(config.get_claim_retries(), 0);
    }
}
