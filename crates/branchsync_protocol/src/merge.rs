//! Strategy application and field-level merging.
//!
//! These functions are pure: re-running the same resolution against the
//! same `(local, server)` pair yields the same resulting record and the
//! same version. Side-effect guarding (compare-and-set writes) belongs to
//! the callers that persist the result.

use crate::conflict::{Conflict, MergeRule, ResolutionPolicy, ResolutionStrategy};
use crate::record::{ChangeAction, ChangeRecord};
use serde_json::{Map, Value};

/// Which side supplied the converged payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// Server copy adopted.
    Server,
    /// Local copy kept.
    Client,
    /// Field-level merge of both.
    Merged,
}

/// A converged record plus application directives.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChange {
    /// The converged record. Its version is strictly greater than both
    /// input versions.
    pub record: ChangeRecord,
    /// Which side won.
    pub winner: Winner,
    /// The local copy won and must be propagated to the counterpart
    /// with high priority.
    pub propagate: bool,
    /// A local deletion marker must be cleared before applying.
    pub clear_local_delete: bool,
}

/// Outcome of applying a strategy to a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The conflict converged automatically.
    Resolved(ResolvedChange),
    /// The strategy defers to an external decision.
    Manual,
}

/// Applies a resolution strategy to a conflict.
///
/// `resolved_by` becomes the `source_branch_id` of the converged record;
/// `now` becomes its `updated_at`.
pub fn resolve_conflict(
    conflict: &Conflict,
    strategy: ResolutionStrategy,
    policy: &ResolutionPolicy,
    resolved_by: &str,
    now: u64,
) -> ResolutionOutcome {
    let local = conflict.local_data.as_ref();
    let server = conflict.server_data.as_ref();
    let next_version = conflict.max_version() + 1;

    match strategy {
        ResolutionStrategy::Manual => ResolutionOutcome::Manual,

        ResolutionStrategy::ServerWins => match server {
            Some(server) => ResolutionOutcome::Resolved(ResolvedChange {
                record: converged(server, next_version, resolved_by, now),
                winner: Winner::Server,
                propagate: false,
                clear_local_delete: local.is_some_and(|l| l.is_delete()) && !server.is_delete(),
            }),
            None => ResolutionOutcome::Manual,
        },

        ResolutionStrategy::ClientWins => match local {
            Some(local) => ResolutionOutcome::Resolved(ResolvedChange {
                record: converged(local, next_version, resolved_by, now),
                winner: Winner::Client,
                propagate: true,
                clear_local_delete: false,
            }),
            None => ResolutionOutcome::Manual,
        },

        ResolutionStrategy::NewestWins => {
            let pick = match (local, server) {
                (Some(l), Some(s)) => {
                    if l.updated_at > s.updated_at {
                        ResolutionStrategy::ClientWins
                    } else if s.updated_at > l.updated_at {
                        ResolutionStrategy::ServerWins
                    } else if l.version > s.version {
                        // Timestamp tie: higher version wins, then server.
                        ResolutionStrategy::ClientWins
                    } else {
                        ResolutionStrategy::ServerWins
                    }
                }
                (Some(_), None) => ResolutionStrategy::ClientWins,
                (None, _) => ResolutionStrategy::ServerWins,
            };
            resolve_conflict(conflict, pick, policy, resolved_by, now)
        }

        ResolutionStrategy::Merge => match (local, server) {
            (Some(local), Some(server)) => {
                let payload = merge_payloads(local, server, policy);
                ResolutionOutcome::Resolved(ResolvedChange {
                    record: ChangeRecord {
                        entity_type: conflict.entity_type.clone(),
                        entity_id: conflict.entity_id.clone(),
                        action: ChangeAction::Update,
                        payload,
                        version: next_version,
                        updated_at: now,
                        source_branch_id: resolved_by.to_string(),
                    },
                    winner: Winner::Merged,
                    propagate: true,
                    clear_local_delete: false,
                })
            }
            _ => ResolutionOutcome::Manual,
        },
    }
}

/// Adopts a winning record under a new version.
fn converged(winner: &ChangeRecord, version: u64, resolved_by: &str, now: u64) -> ChangeRecord {
    ChangeRecord {
        version,
        updated_at: now,
        source_branch_id: resolved_by.to_string(),
        ..winner.clone()
    }
}

/// Field-level merge: starts from the server copy, then applies the
/// configured rule for every field present on either side.
pub fn merge_payloads(
    local: &ChangeRecord,
    server: &ChangeRecord,
    policy: &ResolutionPolicy,
) -> Value {
    let empty = Map::new();
    let local_map = local.payload.as_object().unwrap_or(&empty);
    let server_map = server.payload.as_object().unwrap_or(&empty);

    let mut merged = server_map.clone();
    let mut fields: Vec<&String> = server_map.keys().chain(local_map.keys()).collect();
    fields.sort();
    fields.dedup();

    for field in fields {
        let rule = policy.rule_for(&local.entity_type, field);
        let value = merge_field(
            rule,
            local_map.get(field.as_str()),
            server_map.get(field.as_str()),
            local.updated_at,
            server.updated_at,
        );
        if let Some(value) = value {
            merged.insert(field.clone(), value);
        }
    }

    Value::Object(merged)
}

/// Silent merge for non-key divergence: the server copy is adopted (no
/// conflict is raised, no version bump), and local edits survive only on
/// non-key fields whose rule is `local_always`. The version never
/// regresses below the local copy's.
pub fn silent_merge(
    local: &ChangeRecord,
    server: &ChangeRecord,
    policy: &ResolutionPolicy,
) -> ChangeRecord {
    let mut adopted = server.clone();
    adopted.version = server.version.max(local.version);
    adopted.updated_at = server.updated_at.max(local.updated_at);

    let (Some(local_map), Some(server_map)) =
        (local.payload.as_object(), server.payload.as_object())
    else {
        return adopted;
    };

    let key_fields = policy.key_fields_for(&local.entity_type);
    let mut merged = server_map.clone();
    for (field, value) in local_map {
        let is_key = key_fields.is_some_and(|keys| keys.contains(field));
        if !is_key && policy.rule_for(&local.entity_type, field) == MergeRule::LocalAlways {
            merged.insert(field.clone(), value.clone());
        }
    }

    adopted.payload = Value::Object(merged);
    adopted
}

fn merge_field(
    rule: MergeRule,
    local: Option<&Value>,
    server: Option<&Value>,
    local_ts: u64,
    server_ts: u64,
) -> Option<Value> {
    match rule {
        MergeRule::LocalAlways => local.or(server).cloned(),
        MergeRule::ServerAlways => server.or(local).cloned(),
        MergeRule::Sum => numeric_merge(local, server, |l, s| l + s)
            .or_else(|| newest(local, server, local_ts, server_ts)),
        MergeRule::Max => numeric_merge(local, server, f64::max)
            .or_else(|| newest(local, server, local_ts, server_ts)),
        MergeRule::Min => numeric_merge(local, server, f64::min)
            .or_else(|| newest(local, server, local_ts, server_ts)),
        MergeRule::ConcatSet => Some(concat_set(local, server)),
        MergeRule::Newest => newest(local, server, local_ts, server_ts),
    }
}

fn newest(
    local: Option<&Value>,
    server: Option<&Value>,
    local_ts: u64,
    server_ts: u64,
) -> Option<Value> {
    match (local, server) {
        (Some(l), Some(s)) => {
            // Record-level timestamps decide; ties prefer the server.
            if local_ts > server_ts {
                Some(l.clone())
            } else {
                Some(s.clone())
            }
        }
        (Some(l), None) => Some(l.clone()),
        (None, s) => s.cloned(),
    }
}

/// Applies a numeric combinator, preserving integer representation when
/// both sides are integers. Non-numeric inputs yield `None`.
fn numeric_merge(
    local: Option<&Value>,
    server: Option<&Value>,
    combine: fn(f64, f64) -> f64,
) -> Option<Value> {
    match (local, server) {
        (Some(l), Some(s)) => {
            if let (Some(li), Some(si)) = (l.as_i64(), s.as_i64()) {
                let combined = combine(li as f64, si as f64);
                return Some(Value::from(combined as i64));
            }
            let (lf, sf) = (l.as_f64()?, s.as_f64()?);
            Value::from(combine(lf, sf)).as_f64().map(Value::from)
        }
        (Some(only), None) | (None, Some(only)) => only.is_number().then(|| only.clone()),
        (None, None) => None,
    }
}

/// Set union: server items in order, then local items not already present.
fn concat_set(local: Option<&Value>, server: Option<&Value>) -> Value {
    let mut items: Vec<Value> = to_items(server);
    for item in to_items(local) {
        if !items.contains(&item) {
            items.push(item);
        }
    }
    Value::Array(items)
}

fn to_items(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(scalar) => vec![scalar.clone()],
    }
}
