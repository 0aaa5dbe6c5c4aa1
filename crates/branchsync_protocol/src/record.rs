//! Change records produced by entity sync adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The kind of mutation a change record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Create => write!(f, "create"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
        }
    }
}

/// Identifies one entity across the whole system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeKey {
    /// Entity type (adapter registry key), e.g. `"product"`.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
}

impl ChangeKey {
    /// Creates a key from its parts.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A unit of locally-originated mutation queued for transmission.
///
/// Produced by an entity sync adapter when a local mutation commits.
/// A record is immutable once enqueued; retries re-send the same record.
///
/// # Fields
///
/// - `version`: monotonically increasing per entity
/// - `updated_at`: wall-clock epoch milliseconds at mutation time
/// - `source_branch_id`: the branch that originated the change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Entity type (adapter registry key).
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Kind of mutation.
    pub action: ChangeAction,
    /// Entity payload. A JSON object for create/update; deletes carry
    /// whatever marker payload the adapter emits (usually `null`).
    pub payload: Value,
    /// Monotonically increasing entity version.
    pub version: u64,
    /// Wall-clock epoch milliseconds of the mutation.
    pub updated_at: u64,
    /// Branch that originated the change.
    pub source_branch_id: String,
}

impl ChangeRecord {
    /// Creates a create-record.
    pub fn create(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        version: u64,
        updated_at: u64,
        source_branch_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action: ChangeAction::Create,
            payload,
            version,
            updated_at,
            source_branch_id: source_branch_id.into(),
        }
    }

    /// Creates an update-record.
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        version: u64,
        updated_at: u64,
        source_branch_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action: ChangeAction::Update,
            payload,
            version,
            updated_at,
            source_branch_id: source_branch_id.into(),
        }
    }

    /// Creates a delete-record (tombstone).
    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        version: u64,
        updated_at: u64,
        source_branch_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action: ChangeAction::Delete,
            payload: Value::Null,
            version,
            updated_at,
            source_branch_id: source_branch_id.into(),
        }
    }

    /// Returns the key identifying the entity this record mutates.
    pub fn key(&self) -> ChangeKey {
        ChangeKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Returns true if this record is a deletion.
    pub fn is_delete(&self) -> bool {
        self.action == ChangeAction::Delete
    }

    /// Looks up a payload field, if the payload is an object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.as_object().and_then(|map| map.get(name))
    }
}
