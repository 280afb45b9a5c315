//! Selection criteria for partial loads and deletes.
//!
//! # Purpose
//! Callers select rows two ways:
//! - positionally, Casbin style: `(field_index, ["alice", "", "read"])`
//! - by named attribute: [`FilterDescriptor`]s such as `v0 == "bob"`
//!
//! Both normalize into a [`Selector`], a backend-neutral map from row attribute
//! to accepted values. Backends translate a selector into their own query
//! language (an in-memory predicate, a Mongo filter document, a SQL `WHERE`).
//!
//! # Key invariants
//! - Empty selection values never constrain a field.
//! - Constraints on different attributes are ANDed; values accepted for the
//!   same attribute are ORed.
//! - A selector with no constraints matches everything in its scope.
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use crate::row::{RowField, RuleRow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Backend-neutral row predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    constraints: BTreeMap<RowField, BTreeSet<String>>,
}

impl Selector {
    /// Selector matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_ptype(ptype: &str) -> Self {
        Self::default().with_ptype(ptype)
    }

    pub fn by_id(id: &str) -> Self {
        let mut selector = Self::default();
        selector.accept(RowField::Id, id);
        selector
    }

    /// Positional selection: `values[i]` constrains `v{field_index + i}`.
    ///
    /// Empty values leave their column unconstrained; values that fall past
    /// `v5` are ignored.
    pub fn from_indexed<S: AsRef<str>>(field_index: usize, values: &[S]) -> Self {
        let mut selector = Self::default();
        for (offset, value) in values.iter().enumerate() {
            let value = value.as_ref();
            if value.is_empty() {
                continue;
            }
            if let Some(field) = field_index.checked_add(offset).and_then(RowField::value) {
                selector.accept(field, value);
            }
        }
        selector
    }

    /// Normalize a descriptor filter.
    ///
    /// # Errors
    /// - [`PolicyStoreError::UnsupportedFilterType`] when a descriptor names an
    ///   attribute rows do not have.
    pub fn from_filter(filter: &Filter) -> PolicyStoreResult<Self> {
        let mut selector = Self::default();
        for descriptor in filter.descriptors() {
            let field = descriptor.field()?;
            // An empty acceptance list still constrains its field and matches nothing.
            selector.constraints.entry(field).or_default();
            for value in descriptor.value.accepted() {
                selector.accept(field, value);
            }
        }
        Ok(selector)
    }

    pub fn with_ptype(mut self, ptype: &str) -> Self {
        self.constraints
            .insert(RowField::Ptype, BTreeSet::from([ptype.to_string()]));
        self
    }

    fn accept(&mut self, field: RowField, value: &str) {
        self.constraints
            .entry(field)
            .or_default()
            .insert(value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn constraints(&self) -> impl Iterator<Item = (RowField, &BTreeSet<String>)> {
        self.constraints
            .iter()
            .map(|(field, accepted)| (*field, accepted))
    }

    pub fn matches(&self, row: &RuleRow) -> bool {
        self.constraints
            .iter()
            .all(|(field, accepted)| accepted.contains(row.get(*field)))
    }
}

/// One named-attribute constraint.
///
/// `field_path` addresses the attribute (`["v0"]`, `["ptype"]`); nested paths
/// are joined with `.` and must still resolve to a row attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub field_path: Vec<String>,
    pub value: FilterValue,
}

impl FilterDescriptor {
    pub fn new(field: &str, value: impl Into<FilterValue>) -> Self {
        Self {
            field_path: vec![field.to_string()],
            value: value.into(),
        }
    }

    fn field(&self) -> PolicyStoreResult<RowField> {
        let path = self.field_path.join(".");
        RowField::parse(&path).ok_or_else(|| {
            PolicyStoreError::UnsupportedFilterType(format!("unknown field path {path:?}"))
        })
    }
}

/// A single expected value or a set of acceptable ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(String),
    AnyOf(Vec<String>),
}

impl FilterValue {
    fn accepted(&self) -> &[String] {
        match self {
            FilterValue::One(value) => std::slice::from_ref(value),
            FilterValue::AnyOf(values) => values,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::One(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::One(value)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(values: Vec<String>) -> Self {
        FilterValue::AnyOf(values)
    }
}

impl From<&[&str]> for FilterValue {
    fn from(values: &[&str]) -> Self {
        FilterValue::AnyOf(values.iter().map(|value| value.to_string()).collect())
    }
}

/// Descriptor filter as accepted by `load_filtered_policy`.
///
/// Owned or borrowed descriptors and descriptor sequences all convert into this
/// type, so callers never have to pick a shape up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Single(FilterDescriptor),
    List(Vec<FilterDescriptor>),
}

impl Filter {
    /// Parse a filter supplied as untyped JSON (API payloads, config files).
    ///
    /// # Errors
    /// - [`PolicyStoreError::UnsupportedFilterType`] for anything other than a
    ///   descriptor object or an array of them.
    pub fn from_json(value: serde_json::Value) -> PolicyStoreResult<Self> {
        let kind = json_kind(&value);
        serde_json::from_value(value).map_err(|err| {
            PolicyStoreError::UnsupportedFilterType(format!("{kind}: {err}"))
        })
    }

    pub fn descriptors(&self) -> &[FilterDescriptor] {
        match self {
            Filter::Single(descriptor) => std::slice::from_ref(descriptor),
            Filter::List(descriptors) => descriptors,
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl From<FilterDescriptor> for Filter {
    fn from(descriptor: FilterDescriptor) -> Self {
        Filter::Single(descriptor)
    }
}

impl From<&FilterDescriptor> for Filter {
    fn from(descriptor: &FilterDescriptor) -> Self {
        Filter::Single(descriptor.clone())
    }
}

impl From<Vec<FilterDescriptor>> for Filter {
    fn from(descriptors: Vec<FilterDescriptor>) -> Self {
        Filter::List(descriptors)
    }
}

impl From<&Vec<FilterDescriptor>> for Filter {
    fn from(descriptors: &Vec<FilterDescriptor>) -> Self {
        Filter::List(descriptors.clone())
    }
}

impl From<&[FilterDescriptor]> for Filter {
    fn from(descriptors: &[FilterDescriptor]) -> Self {
        Filter::List(descriptors.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::to_row;

    fn accepted(selector: &Selector, field: RowField) -> Option<Vec<String>> {
        selector
            .constraints()
            .find(|(candidate, _)| *candidate == field)
            .map(|(_, values)| values.iter().cloned().collect())
    }

    #[test]
    fn indexed_selector_skips_empty_values() {
        let selector = Selector::from_indexed(0, &["domain1", "", "", "read"]);
        assert_eq!(
            accepted(&selector, RowField::Value(0)),
            Some(vec!["domain1".to_string()])
        );
        assert_eq!(accepted(&selector, RowField::Value(1)), None);
        assert_eq!(accepted(&selector, RowField::Value(2)), None);
        assert_eq!(
            accepted(&selector, RowField::Value(3)),
            Some(vec!["read".to_string()])
        );
    }

    #[test]
    fn indexed_selector_ignores_values_past_last_column() {
        let selector = Selector::from_indexed(4, &["a", "b", "c", "d"]);
        assert_eq!(selector.constraints().count(), 2);
        assert_eq!(
            accepted(&selector, RowField::Value(5)),
            Some(vec!["b".to_string()])
        );

        let out_of_range = Selector::from_indexed(9, &["x"]);
        assert!(out_of_range.is_empty());

        let overflowing = Selector::from_indexed(usize::MAX, &["a", "b"]);
        assert!(overflowing.is_empty());
    }

    #[test]
    fn indexed_selector_matches_rows() {
        let selector = Selector::from_indexed(1, &["data2"]).with_ptype("p");
        let hit = to_row("p", &["bob", "data2", "write"]).expect("row");
        let miss = to_row("p", &["alice", "data1", "read"]).expect("row");
        let other_ptype = to_row("g", &["bob", "data2"]).expect("row");
        assert!(selector.matches(&hit));
        assert!(!selector.matches(&miss));
        assert!(!selector.matches(&other_ptype));
    }

    #[test]
    fn empty_selector_matches_everything_in_ptype() {
        let selector = Selector::from_indexed(0, &[""]).with_ptype("p");
        let row = to_row("p", &["alice", "data1", "read"]).expect("row");
        assert!(selector.matches(&row));
    }

    #[test]
    fn descriptors_for_same_field_are_ored() {
        let filter = Filter::List(vec![
            FilterDescriptor::new("v0", "alice"),
            FilterDescriptor::new("v0", "bob"),
            FilterDescriptor::new("v2", "write"),
        ]);
        let selector = Selector::from_filter(&filter).expect("selector");

        let alice = to_row("p", &["alice", "data1", "write"]).expect("row");
        let bob = to_row("p", &["bob", "data2", "write"]).expect("row");
        let bob_read = to_row("p", &["bob", "data2", "read"]).expect("row");
        let carol = to_row("p", &["carol", "data2", "write"]).expect("row");
        assert!(selector.matches(&alice));
        assert!(selector.matches(&bob));
        assert!(!selector.matches(&bob_read));
        assert!(!selector.matches(&carol));
    }

    #[test]
    fn acceptance_list_value_behaves_like_repeated_descriptors() {
        let list = Filter::from(FilterDescriptor::new(
            "v0",
            vec!["alice".to_string(), "bob".to_string()],
        ));
        let repeated = Filter::from(vec![
            FilterDescriptor::new("v0", "alice"),
            FilterDescriptor::new("v0", "bob"),
        ]);
        assert_eq!(
            Selector::from_filter(&list).expect("list"),
            Selector::from_filter(&repeated).expect("repeated")
        );
    }

    #[test]
    fn empty_acceptance_list_matches_nothing() {
        let filter = Filter::from(FilterDescriptor::new("v0", Vec::<String>::new()));
        let selector = Selector::from_filter(&filter).expect("selector");
        assert_eq!(accepted(&selector, RowField::Value(0)), Some(Vec::new()));
        let row = to_row("p", &["alice", "data1", "read"]).expect("row");
        assert!(!selector.matches(&row));
    }

    #[test]
    fn every_filter_shape_normalizes_identically() {
        let descriptor = FilterDescriptor::new("v0", "bob");
        let descriptors = vec![descriptor.clone()];
        let shapes = [
            Filter::from(descriptor.clone()),
            Filter::from(&descriptor),
            Filter::from(descriptors.clone()),
            Filter::from(&descriptors),
            Filter::from(descriptors.as_slice()),
        ];
        let expected = Selector::from_filter(&shapes[0]).expect("selector");
        for shape in &shapes {
            assert_eq!(Selector::from_filter(shape).expect("selector"), expected);
        }
    }

    #[test]
    fn unknown_field_path_is_unsupported() {
        let filter = Filter::from(FilterDescriptor::new("subject", "bob"));
        let err = Selector::from_filter(&filter).unwrap_err();
        assert!(matches!(err, PolicyStoreError::UnsupportedFilterType(_)));
    }

    #[test]
    fn json_filters_accept_object_and_array_only() {
        let single = Filter::from_json(serde_json::json!({
            "field_path": ["v0"],
            "value": "bob"
        }))
        .expect("object");
        assert_eq!(single, Filter::from(FilterDescriptor::new("v0", "bob")));

        let list = Filter::from_json(serde_json::json!([
            {"field_path": ["v1"], "value": ["data1", "data2"]}
        ]))
        .expect("array");
        assert_eq!(list.descriptors().len(), 1);

        for bad in [
            serde_json::json!(42),
            serde_json::json!("v0=bob"),
            serde_json::json!({"column": 0}),
        ] {
            let err = Filter::from_json(bad).unwrap_err();
            assert!(matches!(err, PolicyStoreError::UnsupportedFilterType(_)));
        }
    }
}
