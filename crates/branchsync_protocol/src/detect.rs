//! Conflict detection.
//!
//! Classification is a pure function of the `(local, server)` pair: the
//! same inputs always yield the same classification, independent of
//! invocation order.

use crate::conflict::{Conflict, ConflictKind, ResolutionPolicy};
use crate::record::ChangeRecord;
use serde_json::Value;

/// The local side of a comparison: the last-known record for an entity
/// plus the version that was current at the previous successful sync.
///
/// `last_synced_version == None` means the lineage is unknown (the
/// authority compares incoming records this way, using version ordering
/// alone to recognize fast-forwards).
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRevision {
    /// The local copy. A `Delete` action marks a local tombstone.
    pub record: ChangeRecord,
    /// Version current at the previous successful sync, if known.
    pub last_synced_version: Option<u64>,
}

impl LocalRevision {
    /// Creates a revision with known sync lineage.
    pub fn synced(record: ChangeRecord, last_synced_version: u64) -> Self {
        Self {
            record,
            last_synced_version: Some(last_synced_version),
        }
    }

    /// Creates a revision without lineage (authority-side comparisons).
    pub fn unsynced(record: ChangeRecord) -> Self {
        Self {
            record,
            last_synced_version: None,
        }
    }
}

/// Outcome of comparing a local revision against an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Versions or timestamps identical; nothing to do.
    Identical,
    /// The incoming copy supersedes the local one; adopt it as-is.
    AdoptIncoming,
    /// The local copy is strictly ahead; keep it, nothing to adopt.
    KeepLocal,
    /// Divergence confined to non-key fields; merge silently.
    SilentMerge,
    /// Both sides touched at least one key field.
    DataConflict,
    /// One side deleted while the other kept a newer copy.
    DeleteConflict,
    /// Payload shapes disagree.
    SchemaConflict,
}

/// Compares a local revision against an incoming record.
///
/// The algorithm runs in a fixed order:
/// 1. version equality → identical
/// 2. no local edits since the previous sync → adopt incoming
/// 3. bit-identical timestamps → identical
/// 4. key-field comparison → silent merge when none differ
/// 5. otherwise a data conflict
/// with deletions special-cased before the numbered steps: a tombstone on
/// one side against a newer copy on the other is a delete conflict, and
/// entities deleted on both sides are not conflicts.
pub fn classify(
    local: Option<&LocalRevision>,
    incoming: &ChangeRecord,
    policy: &ResolutionPolicy,
) -> Classification {
    let local = match local {
        // Never seen locally: plain adoption.
        None => return Classification::AdoptIncoming,
        Some(rev) => rev,
    };
    let record = &local.record;

    match (record.is_delete(), incoming.is_delete()) {
        (true, true) => return Classification::Identical,
        (true, false) => {
            return if incoming.version > record.version {
                Classification::DeleteConflict
            } else {
                Classification::KeepLocal
            };
        }
        (false, true) => {
            return if locally_edited(local, incoming) {
                Classification::DeleteConflict
            } else {
                Classification::AdoptIncoming
            };
        }
        (false, false) => {}
    }

    // 1. Same version: trust the version counter.
    if record.version == incoming.version {
        return Classification::Identical;
    }

    // 2. No local edits since the previous sync: fast-forward.
    if !locally_edited(local, incoming) {
        return Classification::AdoptIncoming;
    }

    // 2b. The counterpart is unchanged since our last sync: we are ahead.
    if local.last_synced_version == Some(incoming.version) {
        return Classification::KeepLocal;
    }

    // 3. Bit-identical timestamps: treat as the same write.
    if record.updated_at == incoming.updated_at {
        return Classification::Identical;
    }

    // Payload shapes must agree before fields can be compared.
    if record.payload.is_object() != incoming.payload.is_object() {
        return Classification::SchemaConflict;
    }

    // 4. Key-field comparison.
    if key_fields_differ(record, incoming, policy) {
        Classification::DataConflict
    } else {
        Classification::SilentMerge
    }
}

/// Builds a full `Conflict` for classifications that require resolution.
/// Returns `None` for the non-conflicting outcomes.
pub fn detect(
    local: Option<&LocalRevision>,
    incoming: &ChangeRecord,
    policy: &ResolutionPolicy,
) -> Option<Conflict> {
    let kind = match classify(local, incoming, policy) {
        Classification::DataConflict => ConflictKind::Data,
        Classification::DeleteConflict => ConflictKind::Delete,
        Classification::SchemaConflict => ConflictKind::Schema,
        _ => return None,
    };

    Some(Conflict::new(
        kind,
        local.map(|rev| rev.record.clone()),
        Some(incoming.clone()),
    ))
}

/// True when the local side has edits the counterpart has not seen.
///
/// With known lineage this is `version > last_synced_version`; without
/// lineage, version ordering decides (`incoming` newer means our copy has
/// nothing the counterpart lacks).
fn locally_edited(local: &LocalRevision, incoming: &ChangeRecord) -> bool {
    match local.last_synced_version {
        Some(synced) => local.record.version > synced,
        None => local.record.version >= incoming.version,
    }
}

fn key_fields_differ(
    local: &ChangeRecord,
    incoming: &ChangeRecord,
    policy: &ResolutionPolicy,
) -> bool {
    match policy.key_fields_for(&local.entity_type) {
        Some(keys) => keys
            .iter()
            .any(|field| field_of(local, field) != field_of(incoming, field)),
        // No declared key fields: every field counts.
        None => local.payload != incoming.payload,
    }
}

fn field_of<'a>(record: &'a ChangeRecord, field: &str) -> Option<&'a Value> {
    record.payload.as_object().and_then(|map| map.get(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{EntityPolicy, MergeRule, ResolutionStrategy};
    use proptest::prelude::*;
    use serde_json::json;

    fn policy() -> ResolutionPolicy {
        ResolutionPolicy::new(ResolutionStrategy::ServerWins).entity(
            "product",
            EntityPolicy::new(ResolutionStrategy::Merge)
                .key_field("price")
                .key_field("stock")
                .rule("price", MergeRule::Newest)
                .rule("stock", MergeRule::Sum),
        )
    }

    fn local(payload: Value, version: u64, updated_at: u64, synced: u64) -> LocalRevision {
        LocalRevision::synced(
            ChangeRecord::update("product", "p-1", payload, version, updated_at, "br-1"),
            synced,
        )
    }

    fn incoming(payload: Value, version: u64, updated_at: u64) -> ChangeRecord {
        ChangeRecord::update("product", "p-1", payload, version, updated_at, "hq")
    }

    #[test]
    fn absent_locally_adopts_incoming() {
        let p = policy();
        let inc = incoming(json!({"price": 10}), 1, 100);
        assert_eq!(classify(None, &inc, &p), Classification::AdoptIncoming);
    }

    #[test]
    fn equal_versions_are_identical() {
        let p = policy();
        let loc = local(json!({"price": 10}), 5, 100, 5);
        let inc = incoming(json!({"price": 10}), 5, 200);
        assert_eq!(classify(Some(&loc), &inc, &p), Classification::Identical);
    }

    #[test]
    fn no_local_edits_adopts_incoming() {
        let p = policy();
        let loc = local(json!({"price": 10}), 5, 100, 5);
        let inc = incoming(json!({"price": 11}), 7, 200);
        assert_eq!(
            classify(Some(&loc), &inc, &p),
            Classification::AdoptIncoming
        );
    }

    #[test]
    fn counterpart_unchanged_keeps_local() {
        let p = policy();
        let loc = local(json!({"price": 12}), 6, 300, 5);
        let inc = incoming(json!({"price": 10}), 5, 100);
        assert_eq!(classify(Some(&loc), &inc, &p), Classification::KeepLocal);
    }

    #[test]
    fn identical_timestamps_are_identical() {
        let p = policy();
        // Diverged versions but the same wall-clock write.
        let loc = local(json!({"price": 12}), 6, 500, 4);
        let inc = incoming(json!({"price": 12}), 7, 500);
        assert_eq!(classify(Some(&loc), &inc, &p), Classification::Identical);
    }

    #[test]
    fn non_key_divergence_merges_silently() {
        let p = policy();
        // `name` is not a key field for products.
        let loc = local(json!({"price": 10, "name": "local"}), 6, 300, 5);
        let inc = incoming(json!({"price": 10, "name": "server"}), 7, 400);
        assert_eq!(classify(Some(&loc), &inc, &p), Classification::SilentMerge);
    }

    #[test]
    fn key_divergence_is_a_data_conflict() {
        let p = policy();
        let loc = local(json!({"price": 120, "stock": 3}), 6, 300, 5);
        let inc = incoming(json!({"price": 100, "stock": 9}), 7, 400);
        assert_eq!(
            classify(Some(&loc), &inc, &p),
            Classification::DataConflict
        );

        let conflict = detect(Some(&loc), &inc, &p).unwrap();
        assert_eq!(conflict.kind, ConflictKind::Data);
        assert!(conflict.local_data.is_some());
        assert!(conflict.server_data.is_some());
    }

    #[test]
    fn undeclared_entity_type_treats_all_fields_as_key() {
        let p = policy();
        let loc = LocalRevision::synced(
            ChangeRecord::update("client", "c-1", json!({"note": "a"}), 3, 10, "br-1"),
            2,
        );
        let inc = ChangeRecord::update("client", "c-1", json!({"note": "b"}), 4, 20, "hq");
        assert_eq!(
            classify(Some(&loc), &inc, &p),
            Classification::DataConflict
        );
    }

    #[test]
    fn local_delete_against_newer_copy_conflicts() {
        let p = policy();
        let loc = LocalRevision::synced(
            ChangeRecord::delete("product", "p-1", 6, 300, "br-1"),
            5,
        );
        let inc = incoming(json!({"price": 10}), 7, 400);
        assert_eq!(
            classify(Some(&loc), &inc, &p),
            Classification::DeleteConflict
        );
    }

    #[test]
    fn local_delete_newer_than_copy_keeps_local() {
        let p = policy();
        let loc = LocalRevision::synced(
            ChangeRecord::delete("product", "p-1", 8, 500, "br-1"),
            7,
        );
        let inc = incoming(json!({"price": 10}), 7, 400);
        assert_eq!(classify(Some(&loc), &inc, &p), Classification::KeepLocal);
    }

    #[test]
    fn incoming_delete_with_local_edits_conflicts() {
        let p = policy();
        let loc = local(json!({"price": 120}), 6, 300, 5);
        let inc = ChangeRecord::delete("product", "p-1", 7, 400, "hq");
        assert_eq!(
            classify(Some(&loc), &inc, &p),
            Classification::DeleteConflict
        );
    }

    #[test]
    fn incoming_delete_without_local_edits_is_adopted() {
        let p = policy();
        let loc = local(json!({"price": 100}), 5, 100, 5);
        let inc = ChangeRecord::delete("product", "p-1", 6, 400, "hq");
        assert_eq!(
            classify(Some(&loc), &inc, &p),
            Classification::AdoptIncoming
        );
    }

    #[test]
    fn deleted_on_both_sides_is_not_a_conflict() {
        let p = policy();
        let loc = LocalRevision::synced(
            ChangeRecord::delete("product", "p-1", 6, 300, "br-1"),
            5,
        );
        let inc = ChangeRecord::delete("product", "p-1", 7, 400, "hq");
        assert_eq!(classify(Some(&loc), &inc, &p), Classification::Identical);
    }

    #[test]
    fn shape_mismatch_is_a_schema_conflict() {
        let p = policy();
        let loc = local(json!({"price": 120}), 6, 300, 5);
        let inc = incoming(json!("not-an-object"), 7, 400);
        assert_eq!(
            classify(Some(&loc), &inc, &p),
            Classification::SchemaConflict
        );
    }

    #[test]
    fn authority_side_fast_forward_without_lineage() {
        let p = policy();
        let loc = LocalRevision::unsynced(incoming(json!({"price": 10, "stock": 1}), 5, 100));
        let newer = incoming(json!({"price": 11, "stock": 1}), 6, 200);
        assert_eq!(
            classify(Some(&loc), &newer, &p),
            Classification::AdoptIncoming
        );

        let stale = incoming(json!({"price": 9, "stock": 1}), 4, 50);
        // Concurrent lineage with a key field differing: conflict.
        assert_eq!(
            classify(Some(&loc), &stale, &p),
            Classification::DataConflict
        );
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(
            local_version in 1u64..20,
            incoming_version in 1u64..20,
            synced in 0u64..20,
            local_price in 0i64..5,
            incoming_price in 0i64..5,
            local_ts in 0u64..100,
            incoming_ts in 0u64..100,
        ) {
            let p = policy();
            let loc = local(
                json!({"price": local_price, "stock": 1}),
                local_version,
                local_ts,
                synced.min(local_version),
            );
            let inc = incoming(
                json!({"price": incoming_price, "stock": 1}),
                incoming_version,
                incoming_ts,
            );

            let first = classify(Some(&loc), &inc, &p);
            let second = classify(Some(&loc), &inc, &p);
            prop_assert_eq!(first, second);
        }
    }
}
