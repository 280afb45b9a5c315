//! Conversion between engine rules and stored rows.
//!
//! # Purpose
//! An engine rule is a `ptype` plus ordered tokens (`["alice", "data1", "read"]`).
//! Storage wants a fixed six-column row with a stable key. This module is the
//! only place either shape is turned into the other.
//!
//! # Key invariants
//! - The row id is a SHA-256 over `ptype` and all six value columns, so two rows
//!   that differ only in trailing empty tokens share an id.
//! - Decoding trims trailing empty columns; interior empties are preserved.
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use crate::row::{MAX_FIELDS, RuleRow};
use sha2::{Digest, Sha256};
use std::fmt::Write;

// Unit separator keeps ("ab", "c") and ("a", "bc") from hashing alike.
const SEPARATOR: u8 = 0x1f;

/// Encode one engine rule as a storable row.
///
/// # Errors
/// - [`PolicyStoreError::InvalidRule`] when `tokens` has more than six entries.
pub fn to_row<S: AsRef<str>>(ptype: &str, tokens: &[S]) -> PolicyStoreResult<RuleRow> {
    if tokens.len() > MAX_FIELDS {
        return Err(PolicyStoreError::InvalidRule(tokens.len()));
    }
    let mut row = RuleRow {
        ptype: ptype.to_string(),
        ..RuleRow::default()
    };
    for (slot, token) in row.values_mut().into_iter().zip(tokens) {
        *slot = token.as_ref().to_string();
    }
    row.id = rule_id(&row.ptype, &row.values());
    Ok(row)
}

/// Encode a batch, failing on the first oversized rule.
pub fn to_rows<S: AsRef<str>>(ptype: &str, rules: &[Vec<S>]) -> PolicyStoreResult<Vec<RuleRow>> {
    rules.iter().map(|rule| to_row(ptype, rule)).collect()
}

/// Decode a stored row back into `(ptype, tokens)`.
pub fn to_tokens(row: &RuleRow) -> (String, Vec<String>) {
    let values = row.values();
    let used = values
        .iter()
        .rposition(|value| !value.is_empty())
        .map_or(0, |last| last + 1);
    let tokens = values[..used].iter().map(|value| value.to_string()).collect();
    (row.ptype.clone(), tokens)
}

/// Derived identity key for a row's content.
pub fn rule_id(ptype: &str, values: &[&str; MAX_FIELDS]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ptype.as_bytes());
    for value in values {
        hasher.update([SEPARATOR]);
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(id, "{byte:02x}");
    }
    id
}
