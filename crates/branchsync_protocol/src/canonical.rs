//! Canonical JSON serialization and batch checksums.
//!
//! Sender and receiver must independently recompute the same digest for a
//! batch, so the serialization is deterministic:
//!
//! - Object keys are sorted bytewise, recursively
//! - Integers are printed without a decimal point
//! - Floats use the shortest round-trip representation
//! - No insignificant whitespace
//! - Records are digested in a canonical order independent of how the
//!   in-memory batch was built

use crate::record::ChangeRecord;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while canonicalizing or hashing.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Serialization to a JSON value failed.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serializes a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            // serde_json prints i64/u64 without a decimal point and floats
            // with the shortest round-trip form, which is stable per value.
            out.push_str(&n.to_string());
        }
        Value::String(s) => {
            // serde_json's string escaping is deterministic.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Canonically serializes one change record.
pub fn canonical_record(record: &ChangeRecord) -> CodecResult<String> {
    let value = serde_json::to_value(record)?;
    Ok(canonical_json(&value))
}

/// Computes the integrity checksum of a change batch.
///
/// Records are canonicalized individually and digested in sorted order,
/// so the checksum is independent of the construction order of the batch.
/// Returns a lowercase hex-encoded SHA-256 digest.
pub fn batch_checksum(records: &[ChangeRecord]) -> CodecResult<String> {
    let mut lines = Vec::with_capacity(records.len());
    for record in records {
        lines.push(canonical_record(record)?);
    }
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the checksum of a per-table record map (pull responses).
///
/// Flattens all tables into one batch; table membership is already encoded
/// in each record's `entity_type`.
pub fn tables_checksum<'a, I>(tables: I) -> CodecResult<String>
where
    I: IntoIterator<Item = &'a Vec<ChangeRecord>>,
{
    let mut all: Vec<ChangeRecord> = Vec::new();
    for records in tables {
        all.extend(records.iter().cloned());
    }
    batch_checksum(&all)
}
