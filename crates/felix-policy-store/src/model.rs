//! In-process policy model the adapter loads into and saves from.
//!
//! The adapter never parses model definitions. It only needs a sink for rule
//! lines on load and a source of rule lines on save, which is what
//! [`PolicyModel`] captures. [`PolicySet`] is the plain implementation used by
//! callers that hold rules outside an enforcer (and by the enforcer bridge);
//! Casbin's own model is adapted when the adapter is driven by an enforcer.
use crate::row::section_for;
use std::collections::BTreeMap;

pub trait PolicyModel: Send {
    /// Add one rule line; returns `false` when the line was already present.
    fn add_policy_line(&mut self, sec: &str, ptype: &str, rule: Vec<String>) -> bool;

    /// Every ptype the model defines, including ones that currently hold no
    /// rules.
    fn ptypes(&self) -> Vec<String>;

    /// Every rule line as `(ptype, tokens)`.
    fn policy_lines(&self) -> Vec<(String, Vec<String>)>;
}

/// Rules grouped by ptype, deduplicated, in insertion order per ptype.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    rules: BTreeMap<String, Vec<Vec<String>>>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a ptype so saves clear it even when it holds no rules.
    pub fn define_ptype(&mut self, ptype: &str) {
        self.rules.entry(ptype.to_string()).or_default();
    }

    pub fn add_rule<S: AsRef<str>>(&mut self, ptype: &str, rule: &[S]) -> bool {
        let rule = rule.iter().map(|token| token.as_ref().to_string()).collect();
        self.add_policy_line(section_for(ptype), ptype, rule)
    }

    pub fn get_policy(&self, ptype: &str) -> &[Vec<String>] {
        self.rules.get(ptype).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_policy<S: AsRef<str>>(&self, ptype: &str, rule: &[S]) -> bool {
        self.get_policy(ptype).iter().any(|existing| {
            existing.len() == rule.len()
                && existing
                    .iter()
                    .zip(rule)
                    .all(|(left, right)| left == right.as_ref())
        })
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PolicyModel for PolicySet {
    fn add_policy_line(&mut self, _sec: &str, ptype: &str, rule: Vec<String>) -> bool {
        let lines = self.rules.entry(ptype.to_string()).or_default();
        if lines.contains(&rule) {
            return false;
        }
        lines.push(rule);
        true
    }

    fn ptypes(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    fn policy_lines(&self) -> Vec<(String, Vec<String>)> {
        self.rules
            .iter()
            .flat_map(|(ptype, lines)| lines.iter().map(move |rule| (ptype.clone(), rule.clone())))
            .collect()
    }
}

/// A Casbin model seen through [`PolicyModel`].
pub(crate) struct CasbinModel<'a>(pub(crate) &'a mut dyn casbin::Model);

const SECTIONS: [&str; 2] = ["p", "g"];

impl PolicyModel for CasbinModel<'_> {
    fn add_policy_line(&mut self, sec: &str, ptype: &str, rule: Vec<String>) -> bool {
        self.0.add_policy(sec, ptype, rule)
    }

    fn ptypes(&self) -> Vec<String> {
        let model = self.0.get_model();
        SECTIONS
            .iter()
            .filter_map(|sec| model.get(*sec))
            .flat_map(|assertions| assertions.keys().cloned())
            .collect()
    }

    fn policy_lines(&self) -> Vec<(String, Vec<String>)> {
        let model = self.0.get_model();
        SECTIONS
            .iter()
            .filter_map(|sec| model.get(*sec))
            .flat_map(|assertions| {
                assertions.iter().flat_map(|(ptype, assertion)| {
                    assertion
                        .get_policy()
                        .iter()
                        .map(move |rule| (ptype.clone(), rule.clone()))
                })
            })
            .collect()
    }
}
