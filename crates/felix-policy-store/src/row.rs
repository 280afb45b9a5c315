//! Persisted shape of a single policy or grouping line.
//!
//! # Purpose
//! Defines the normalized rule record every backend stores and the closed set
//! of attributes selectors may constrain.
//!
//! # Key invariants
//! - At most [`MAX_FIELDS`] value fields; unused trailing fields are empty.
//! - `id` is derived from `ptype` and `v0..v5` (see [`crate::codec`]); rows
//!   are never built with a hand-picked id outside tests.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of value columns a rule row carries (`v0` through `v5`).
pub const MAX_FIELDS: usize = 6;

const VALUE_NAMES: [&str; MAX_FIELDS] = ["v0", "v1", "v2", "v3", "v4", "v5"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleRow {
    pub id: String,
    pub ptype: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v0: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v1: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v2: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v3: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v4: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v5: String,
}

impl RuleRow {
    pub fn values(&self) -> [&str; MAX_FIELDS] {
        [
            self.v0.as_str(),
            self.v1.as_str(),
            self.v2.as_str(),
            self.v3.as_str(),
            self.v4.as_str(),
            self.v5.as_str(),
        ]
    }

    pub(crate) fn values_mut(&mut self) -> [&mut String; MAX_FIELDS] {
        [
            &mut self.v0,
            &mut self.v1,
            &mut self.v2,
            &mut self.v3,
            &mut self.v4,
            &mut self.v5,
        ]
    }

    /// Value of `field` as stored; empty string when the column is unused.
    pub fn get(&self, field: RowField) -> &str {
        match field {
            RowField::Id => &self.id,
            RowField::Ptype => &self.ptype,
            RowField::Value(index) => self.values()[index as usize],
        }
    }

    /// Casbin section the row belongs to, derived from its ptype (`g*` rows
    /// are role groupings, everything else is a policy line).
    pub fn section(&self) -> &'static str {
        section_for(&self.ptype)
    }
}

pub fn section_for(ptype: &str) -> &'static str {
    if ptype.starts_with('g') {
        "g"
    } else {
        "p"
    }
}

/// Row attribute addressable by a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowField {
    Id,
    Ptype,
    /// `v{n}` for `n` in `0..MAX_FIELDS`.
    Value(u8),
}

impl RowField {
    pub fn value(index: usize) -> Option<Self> {
        (index < MAX_FIELDS).then(|| RowField::Value(index as u8))
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "id" | "_id" => Some(RowField::Id),
            "ptype" => Some(RowField::Ptype),
            other => VALUE_NAMES
                .iter()
                .position(|candidate| *candidate == other)
                .and_then(RowField::value),
        }
    }

    /// Column/document attribute name. Static so backends can splice it into
    /// queries without escaping.
    pub fn name(self) -> &'static str {
        match self {
            RowField::Id => "id",
            RowField::Ptype => "ptype",
            RowField::Value(index) => VALUE_NAMES[index as usize],
        }
    }
}

impl fmt::Display for RowField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
