//! Entity-level writes that travel between the device and the metadata API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of entity write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for Operation {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation '{}'",
                other
            ))),
        }
    }
}

/// A local write waiting to be accepted by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Table the entity belongs to, e.g. `products`.
    pub entity: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed upload attempts so far.
    pub attempts: u32,
}

impl PendingMutation {
    /// Create a fresh mutation stamped with the current time.
    pub fn new(entity: impl Into<String>, operation: Operation, payload: serde_json::Value) -> Self {
        Self {
            entity: entity.into(),
            operation,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// A row changed on the remote side since the last pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub table: String,
    pub row: serde_json::Value,
}
