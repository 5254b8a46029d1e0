use crate::errors::QueueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a job as handed around by callers.
///
/// Callers may pass any string; it is only checked to be a UUID when an
/// operation needs to reach the store, so malformed input fails with
/// [`QueueError::InvalidIdentifier`] before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentifier(String);

impl JobIdentifier {
    /// Generate a fresh identifier.
    ///
    /// UUIDv7 is used so identifiers sort in creation order, which keeps the
    /// `id` tie-break of the claim ordering consistent with FIFO.
    pub fn generate() -> Self {
        Uuid::now_v7().into()
    }

    /// The identifier as given by the caller.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the identifier into the UUID used as primary key.
    pub fn to_uuid(&self) -> Result<Uuid, QueueError> {
        Uuid::try_parse(&self.0).map_err(|_| QueueError::InvalidIdentifier(self.0.clone()))
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for JobIdentifier {
    fn from(id: Uuid) -> Self {
        Self(id.hyphenated().to_string())
    }
}

impl From<String> for JobIdentifier {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobIdentifier {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}
