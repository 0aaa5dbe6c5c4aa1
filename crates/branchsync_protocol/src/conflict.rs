//! Conflict model and resolution policy.

use crate::record::ChangeRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Classification of a detected divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Both sides modified at least one key field.
    Data,
    /// One side deleted while the other kept a newer copy.
    Delete,
    /// Referential integrity broke while applying the record.
    Relationship,
    /// A version-checked write found an unexpected version.
    Version,
    /// Payload shapes disagree (object vs non-object).
    Schema,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Data => write!(f, "DATA"),
            ConflictKind::Delete => write!(f, "DELETE"),
            ConflictKind::Relationship => write!(f, "RELATIONSHIP"),
            ConflictKind::Version => write!(f, "VERSION"),
            ConflictKind::Schema => write!(f, "SCHEMA"),
        }
    }
}

/// Strategy used to converge a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Adopt the server record; clear any local deletion marker.
    ServerWins,
    /// Keep the local record; mark it high-priority for propagation.
    ClientWins,
    /// Compare `updated_at` and apply server-wins or client-wins.
    NewestWins,
    /// Field-level merge starting from the server copy.
    Merge,
    /// Do not resolve; emit a resolution ticket.
    Manual,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::ServerWins => write!(f, "server_wins"),
            ResolutionStrategy::ClientWins => write!(f, "client_wins"),
            ResolutionStrategy::NewestWins => write!(f, "newest_wins"),
            ResolutionStrategy::Merge => write!(f, "merge"),
            ResolutionStrategy::Manual => write!(f, "manual"),
        }
    }
}

/// Per-field rule applied by the `Merge` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Always take the local value.
    LocalAlways,
    /// Always take the server value.
    ServerAlways,
    /// Numeric addition of both sides. Adapters that maintain counters
    /// emit delta-valued fields for sum-ruled fields.
    Sum,
    /// Numeric maximum of both sides.
    Max,
    /// Numeric minimum of both sides.
    Min,
    /// Set union of both sides (arrays; scalars treated as singletons).
    ConcatSet,
    /// Take the value from the side with the newer record timestamp.
    Newest,
}

/// A detected divergence between two versions of the same entity.
///
/// Created transiently during merge-time comparison and destroyed once a
/// resolution is persisted; the outcome survives only as an audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Conflict classification.
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    /// Entity type.
    pub entity_type: String,
    /// Entity identifier.
    pub entity_id: String,
    /// The local copy, if one exists.
    pub local_data: Option<ChangeRecord>,
    /// The server copy, if one exists.
    pub server_data: Option<ChangeRecord>,
    /// Strategy applied, once resolved.
    pub strategy_used: Option<ResolutionStrategy>,
    /// Whether a resolution has been produced.
    pub resolved: bool,
    /// Epoch milliseconds of resolution.
    pub resolved_at: Option<u64>,
}

impl Conflict {
    /// Creates a new unresolved conflict.
    pub fn new(
        kind: ConflictKind,
        local: Option<ChangeRecord>,
        server: Option<ChangeRecord>,
    ) -> Self {
        let (entity_type, entity_id) = local
            .as_ref()
            .or(server.as_ref())
            .map(|r| (r.entity_type.clone(), r.entity_id.clone()))
            .unwrap_or_default();

        Self {
            kind,
            entity_type,
            entity_id,
            local_data: local,
            server_data: server,
            strategy_used: None,
            resolved: false,
            resolved_at: None,
        }
    }

    /// Marks this conflict resolved with the given strategy.
    pub fn mark_resolved(&mut self, strategy: ResolutionStrategy, at: u64) {
        self.strategy_used = Some(strategy);
        self.resolved = true;
        self.resolved_at = Some(at);
    }

    /// Highest version seen on either side.
    pub fn max_version(&self) -> u64 {
        let local = self.local_data.as_ref().map(|r| r.version).unwrap_or(0);
        let server = self.server_data.as_ref().map(|r| r.version).unwrap_or(0);
        local.max(server)
    }
}

/// Errors raised while validating a resolution policy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    /// `Merge` declared for an entity type without any field rules.
    #[error("entity type '{0}' uses merge strategy but declares no field rules")]
    MergeWithoutRules(String),
    /// An entity policy declared an empty key-field set explicitly.
    #[error("entity type '{0}' declares an empty key-field set")]
    EmptyKeyFields(String),
    /// `Manual` cannot be the global default strategy.
    #[error("manual resolution cannot be the global default strategy")]
    ManualDefault,
}

/// Per-entity-type resolution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPolicy {
    /// Strategy used for this entity type.
    pub strategy: ResolutionStrategy,
    /// Fields whose divergence constitutes a conflict. When empty at
    /// lookup time (entity type not declared), every field is a key field.
    pub key_fields: BTreeSet<String>,
    /// Field-level merge rules; fields without a rule default to `Newest`.
    pub field_rules: BTreeMap<String, MergeRule>,
}

impl EntityPolicy {
    /// Creates a policy entry with the given strategy.
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self {
            strategy,
            key_fields: BTreeSet::new(),
            field_rules: BTreeMap::new(),
        }
    }

    /// Declares a key field.
    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_fields.insert(field.into());
        self
    }

    /// Declares a field-level merge rule.
    pub fn rule(mut self, field: impl Into<String>, rule: MergeRule) -> Self {
        self.field_rules.insert(field.into(), rule);
        self
    }
}

/// Resolution policy: a global default strategy plus per-entity-type
/// overrides with key-field sets and field-level merge-rule tables.
///
/// Validated once at construction time, not per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPolicy {
    /// Strategy used when an entity type has no override.
    pub default_strategy: ResolutionStrategy,
    /// Per-entity-type overrides.
    pub entities: BTreeMap<String, EntityPolicy>,
}

impl ResolutionPolicy {
    /// Creates a policy with the given default strategy.
    pub fn new(default_strategy: ResolutionStrategy) -> Self {
        Self {
            default_strategy,
            entities: BTreeMap::new(),
        }
    }

    /// Adds a per-entity-type policy.
    pub fn entity(mut self, entity_type: impl Into<String>, policy: EntityPolicy) -> Self {
        self.entities.insert(entity_type.into(), policy);
        self
    }

    /// Validates the whole table. Called once when the policy is installed.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.default_strategy == ResolutionStrategy::Manual {
            return Err(PolicyError::ManualDefault);
        }
        for (entity_type, policy) in &self.entities {
            if policy.strategy == ResolutionStrategy::Merge && policy.field_rules.is_empty() {
                return Err(PolicyError::MergeWithoutRules(entity_type.clone()));
            }
        }
        Ok(())
    }

    /// Strategy configured for an entity type.
    pub fn strategy_for(&self, entity_type: &str) -> ResolutionStrategy {
        self.entities
            .get(entity_type)
            .map(|p| p.strategy)
            .unwrap_or(self.default_strategy)
    }

    /// Declared key fields for an entity type; `None` means every field
    /// counts as a key field.
    pub fn key_fields_for(&self, entity_type: &str) -> Option<&BTreeSet<String>> {
        self.entities
            .get(entity_type)
            .filter(|p| !p.key_fields.is_empty())
            .map(|p| &p.key_fields)
    }

    /// Merge rule for a field, defaulting to `Newest`.
    pub fn rule_for(&self, entity_type: &str, field: &str) -> MergeRule {
        self.entities
            .get(entity_type)
            .and_then(|p| p.field_rules.get(field))
            .copied()
            .unwrap_or(MergeRule::Newest)
    }

    /// Effective strategy for a conflict kind: delete and schema conflicts
    /// are never merged, so `Merge` downgrades to `Manual` for them.
    pub fn effective_strategy(&self, entity_type: &str, kind: ConflictKind) -> ResolutionStrategy {
        let configured = self.strategy_for(entity_type);
        match (kind, configured) {
            (ConflictKind::Delete | ConflictKind::Schema, ResolutionStrategy::Merge) => {
                ResolutionStrategy::Manual
            }
            _ => configured,
        }
    }
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self::new(ResolutionStrategy::ServerWins)
    }
}
