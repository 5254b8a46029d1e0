//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the job table and the validated
//! table name every query is rendered against.

use crate::config::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// The table name used when none is configured.
pub const DEFAULT_TABLE: &str = "jobs";

/// Columns selected whenever a full [`JobRecord`] is loaded.
pub(crate) const RECORD_COLUMNS: &str = "id, queue, data, state, created_at, updated_at, deleted_at";

/// Lifecycle state of a job row.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Default,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    /// Ready to be picked up for execution
    #[default]
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Executed, regardless if it was successful or not
    Completed,
}

impl JobState {
    /// The value stored in the `state` column.
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Whether a job in this state may move to `next`.
    ///
    /// Any state may be re-armed to pending. A completed job can only leave
    /// that state through a requeue.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (_, Self::Pending) => true,
            (Self::Pending, Self::Processing) => true,
            (Self::Pending | Self::Processing, Self::Completed) => true,
            (Self::Processing | Self::Completed, Self::Processing) => false,
            (Self::Completed, Self::Completed) => false,
        }
    }
}

impl TryFrom<String> for JobState {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A validated, possibly schema-qualified, table name.
///
/// Table names cannot be bound as query parameters, so they are checked once
/// here and always rendered double-quoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobTable {
    schema: Option<String>,
    name: String,
}

impl JobTable {
    /// Validate `name`, which may take the form `schema.table`.
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidTableName(name.to_owned());
        let (schema, table) = match name.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, name),
        };

        if !schema.is_none_or(is_identifier)
            || !is_identifier(table)
            || table.len() > MAX_TABLE_NAME_LEN
        {
            return Err(invalid());
        }

        Ok(Self {
            schema: schema.map(str::to_owned),
            name: table.to_owned(),
        })
    }

    /// The unqualified table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The quoted name to splice into SQL.
    pub(crate) fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!(r#""{schema}"."{}""#, self.name),
            None => format!(r#""{}""#, self.name),
        }
    }

    /// Name of the partial index backing the claim query. Indexes always
    /// live in the schema of their table, so this is never qualified.
    pub(crate) fn pending_index(&self) -> String {
        format!(r#""{}{PENDING_INDEX_SUFFIX}""#, self.name)
    }

    /// Key used to serialize claims for one queue of this table.
    pub(crate) fn lock_key(&self, queue: &str) -> String {
        format!("{self}:{queue}")
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self {
            schema: None,
            name: DEFAULT_TABLE.to_owned(),
        }
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl TryFrom<String> for JobTable {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<JobTable> for String {
    fn from(table: JobTable) -> Self {
        table.to_string()
    }
}

/// Longest identifier PostgreSQL keeps without truncating it.
const MAX_IDENTIFIER_LEN: usize = 63;

const PENDING_INDEX_SUFFIX: &str = "_pending_idx";

/// Longest table name whose pending index name still fits an identifier.
const MAX_TABLE_NAME_LEN: usize = MAX_IDENTIFIER_LEN - PENDING_INDEX_SUFFIX.len();

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_well && part.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The payload stored in the `data` column.
///
/// The queue never looks inside it; only the worker side does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    /// Layout version of this payload
    #[serde(default = "JobData::current_version")]
    pub version: u16,
    /// Name used to dispatch the job to its handler
    pub job_name: String,
    /// Arguments of the job
    pub payload: Value,
    /// How many times a failed job is requeued before it is given up
    #[serde(default)]
    pub max_retry_count: u32,
    /// Number of failed executions so far
    #[serde(default)]
    pub attempts: u32,
    /// When the job was first enqueued
    pub queued_at: DateTime<Utc>,
}

impl JobData {
    /// The payload layout written by this version of the crate.
    pub const CURRENT_VERSION: u16 = 1;

    /// Build a fresh payload for `job_name`.
    pub fn new(job_name: impl Into<String>, payload: Value) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            job_name: job_name.into(),
            payload,
            max_retry_count: 0,
            attempts: 0,
            queued_at: Utc::now(),
        }
    }

    /// Set how often the job may be retried after failing.
    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    /// Whether another attempt is allowed after a failure.
    pub fn has_retries_left(&self) -> bool {
        self.attempts < self.max_retry_count
    }

    fn current_version() -> u16 {
        Self::CURRENT_VERSION
    }
}

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Unique identifier for the job
    pub id: Uuid,
    /// Name of the queue the job belongs to
    pub queue: String,
    /// The opaque job payload
    #[sqlx(json)]
    pub data: JobData,
    /// Current lifecycle state
    #[sqlx(try_from = "String")]
    pub state: JobState,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last change to the row
    pub updated_at: DateTime<Utc>,
    /// Timestamp when the job was retired, if soft deletes are enabled
    pub deleted_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Whether the job has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Summary of a job, suitable for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    /// Unique identifier for the job
    pub id: Uuid,
    /// Name of the queue the job belongs to
    pub queue: String,
    /// Name of the job type
    pub job_name: String,
    /// Current lifecycle state
    pub state: JobState,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp when the job was retired
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobInfo {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            queue: record.queue,
            job_name: record.data.job_name,
            state: record.state,
            created_at: record.created_at,
            completed_at: record.deleted_at,
        }
    }
}
