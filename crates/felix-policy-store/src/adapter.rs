//! Policy adapter: keeps a store in step with an engine's rule set.
//!
//! # Purpose
//! [`DocstoreAdapter`] is the engine-facing surface. It encodes rules with
//! [`crate::codec`], builds selectors with [`crate::filter`], and drives a
//! [`RuleGateway`] obtained from the [`DriverRegistry`].
//!
//! # Key invariants
//! - After a filtered load the adapter refuses to save: the in-memory model is
//!   a subset of the store and saving it would drop the rest. A full load
//!   clears that state.
//! - Re-adding a stored rule and removing a missing one both succeed.
//! - Updates go through [`RuleGateway::replace`], so they are atomic whenever
//!   the backend supports transactions and best-effort otherwise.
//!
//! The adapter also implements [`casbin::Adapter`], so an `Enforcer` can own it
//! directly and persist changes with auto-save.
//!
//! # Example
//! ```rust,no_run
//! use felix_policy_store::{DocstoreAdapter, DriverRegistry, PolicySet};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> felix_policy_store::PolicyStoreResult<()> {
//! let registry = DriverRegistry::with_memory_driver();
//! let adapter = DocstoreAdapter::open(&registry, "mem://casbin_rule/id").await?;
//! let cancel = CancellationToken::new();
//! adapter
//!     .add_policy(&cancel, "p", "p", &["alice", "data1", "read"])
//!     .await?;
//! let mut rules = PolicySet::new();
//! adapter.load_policy(&cancel, &mut rules).await?;
//! # Ok(())
//! # }
//! ```
use crate::codec::{to_row, to_rows, to_tokens};
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use crate::filter::{Filter, Selector};
use crate::gateway::{ReplaceBatch, RuleGateway};
use crate::model::{CasbinModel, PolicyModel};
use crate::registry::DriverRegistry;
use crate::row::{RuleRow, section_for};
use async_trait::async_trait;
use casbin::Filter as CasbinFilter;
use futures::TryStreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

pub struct DocstoreAdapter {
    gateway: Arc<dyn RuleGateway>,
    filtered: AtomicBool,
}

impl DocstoreAdapter {
    pub fn new(gateway: Arc<dyn RuleGateway>) -> Self {
        Self {
            gateway,
            filtered: AtomicBool::new(false),
        }
    }

    /// Resolve `url` through `registry` and wrap the resulting gateway.
    pub async fn open(registry: &DriverRegistry, url: &str) -> PolicyStoreResult<Self> {
        let gateway = registry.resolve(url).await?;
        tracing::debug!(backend = gateway.backend_name(), "opened policy adapter");
        Ok(Self::new(gateway))
    }

    pub fn gateway(&self) -> &Arc<dyn RuleGateway> {
        &self.gateway
    }

    pub fn backend_name(&self) -> &'static str {
        self.gateway.backend_name()
    }

    pub fn supports_transactions(&self) -> bool {
        self.gateway.supports_transactions()
    }

    pub async fn health_check(&self) -> PolicyStoreResult<()> {
        self.gateway.health_check().await
    }

    /// Whether the last load was filtered.
    pub fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    /// Load every stored rule into `model` and clear the filtered state.
    pub async fn load_policy(
        &self,
        cancel: &CancellationToken,
        model: &mut dyn PolicyModel,
    ) -> PolicyStoreResult<()> {
        let loaded = self.load_into(cancel, &Selector::all(), None, model).await?;
        self.filtered.store(false, Ordering::SeqCst);
        metrics::gauge!("felix_policy_rows_loaded").set(loaded as f64);
        tracing::debug!(loaded, "loaded policy");
        Ok(())
    }

    /// Load only the rules matching `filter` and mark the adapter filtered.
    ///
    /// # Errors
    /// - [`PolicyStoreError::UnsupportedFilterType`] when a descriptor names an
    ///   unknown attribute. The filtered state is left unchanged.
    pub async fn load_filtered_policy(
        &self,
        cancel: &CancellationToken,
        model: &mut dyn PolicyModel,
        filter: impl Into<Filter>,
    ) -> PolicyStoreResult<()> {
        let selector = Selector::from_filter(&filter.into())?;
        let loaded = self.load_into(cancel, &selector, None, model).await?;
        self.filtered.store(true, Ordering::SeqCst);
        tracing::debug!(loaded, "loaded filtered policy");
        Ok(())
    }

    /// Feed matching rows into `model`, keeping only rows of `section` when
    /// one is given.
    async fn load_into(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
        section: Option<&str>,
        model: &mut dyn PolicyModel,
    ) -> PolicyStoreResult<usize> {
        let mut rows = self.gateway.load(cancel, selector).await?;
        let mut loaded = 0;
        while let Some(row) = rows.try_next().await? {
            let (ptype, tokens) = to_tokens(&row);
            let sec = section_for(&ptype);
            if section.is_some_and(|wanted| wanted != sec) {
                continue;
            }
            model.add_policy_line(sec, &ptype, tokens);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Replace the stored rules of every ptype the model defines with the
    /// model's rules.
    ///
    /// # Errors
    /// - [`PolicyStoreError::FilteredSave`] after a filtered load; nothing is
    ///   written.
    pub async fn save_policy(
        &self,
        cancel: &CancellationToken,
        model: &(dyn PolicyModel + Sync),
    ) -> PolicyStoreResult<()> {
        if self.is_filtered() {
            return Err(PolicyStoreError::FilteredSave);
        }
        let rows = model
            .policy_lines()
            .into_iter()
            .map(|(ptype, rule)| to_row(&ptype, &rule))
            .collect::<PolicyStoreResult<Vec<RuleRow>>>()?;
        let remove = model
            .ptypes()
            .iter()
            .map(|ptype| Selector::for_ptype(ptype))
            .collect();
        let written = rows.len();
        let removed = self
            .gateway
            .replace(cancel, ReplaceBatch { remove, insert: rows })
            .await?;
        record_removed("save", removed.len());
        record_written("save", written);
        tracing::debug!(written, removed = removed.len(), "saved policy");
        Ok(())
    }

    /// Persist one rule. Storing a rule that already exists succeeds.
    pub async fn add_policy<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        rule: &[S],
    ) -> PolicyStoreResult<()> {
        let row = to_row(ptype, rule)?;
        match self.gateway.insert_one(cancel, row).await {
            Ok(()) => record_written("add", 1),
            Err(PolicyStoreError::DuplicateKey(id)) => {
                tracing::debug!(sec, ptype, id = %id, "rule already stored");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    pub async fn add_policies<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        rules: &[Vec<S>],
    ) -> PolicyStoreResult<()> {
        let rows = to_rows(ptype, rules)?;
        if rows.is_empty() {
            return Ok(());
        }
        let requested = rows.len();
        let inserted = self.gateway.insert_many(cancel, rows).await?;
        record_written("add", inserted as usize);
        tracing::debug!(sec, ptype, requested, inserted, "added policies");
        Ok(())
    }

    /// Remove one rule; removing a rule that is not stored succeeds.
    pub async fn remove_policy<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        rule: &[S],
    ) -> PolicyStoreResult<()> {
        let row = to_row(ptype, rule)?;
        let removed = self.gateway.delete_many(cancel, &[row.id]).await?;
        record_removed("remove", removed as usize);
        tracing::debug!(sec, ptype, removed, "removed policy");
        Ok(())
    }

    pub async fn remove_policies<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        rules: &[Vec<S>],
    ) -> PolicyStoreResult<()> {
        let ids: Vec<String> = to_rows(ptype, rules)?
            .into_iter()
            .map(|row| row.id)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let removed = self.gateway.delete_many(cancel, &ids).await?;
        record_removed("remove", removed as usize);
        tracing::debug!(sec, ptype, requested = ids.len(), removed, "removed policies");
        Ok(())
    }

    /// Remove every `ptype` rule whose values from `field_index` on match
    /// `field_values`; empty values match anything. Returns the number removed.
    pub async fn remove_filtered_policy<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: &[S],
    ) -> PolicyStoreResult<u64> {
        let selector = Selector::from_indexed(field_index, field_values).with_ptype(ptype);
        let removed = self.gateway.delete_by_selector(cancel, &selector).await?;
        record_removed("remove_filtered", removed as usize);
        tracing::debug!(sec, ptype, field_index, removed, "removed filtered policy");
        Ok(removed)
    }

    /// Replace `old_rule` with `new_rule`. Nothing is written when both encode
    /// to the same row.
    pub async fn update_policy<S: AsRef<str>, T: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        old_rule: &[S],
        new_rule: &[T],
    ) -> PolicyStoreResult<()> {
        let old = to_row(ptype, old_rule)?;
        let new = to_row(ptype, new_rule)?;
        if old.id == new.id {
            return Ok(());
        }
        self.apply_update(
            cancel,
            "update",
            ReplaceBatch {
                remove: vec![Selector::by_id(&old.id)],
                insert: vec![new],
            },
        )
        .await?;
        tracing::debug!(sec, ptype, "updated policy");
        Ok(())
    }

    /// Pairwise update applied as one batch.
    ///
    /// The batch has the same outcome as applying the pairs in order, so a
    /// chain such as `[a -> b, b -> c]` leaves only `c`. Pairs whose rules
    /// encode to the same row are skipped.
    ///
    /// # Errors
    /// - [`PolicyStoreError::LengthMismatch`] when the slices differ in length;
    ///   nothing is attempted.
    pub async fn update_policies<S: AsRef<str>, T: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        old_rules: &[Vec<S>],
        new_rules: &[Vec<T>],
    ) -> PolicyStoreResult<()> {
        if old_rules.len() != new_rules.len() {
            return Err(PolicyStoreError::LengthMismatch {
                old: old_rules.len(),
                new: new_rules.len(),
            });
        }
        let olds = to_rows(ptype, old_rules)?;
        let news = to_rows(ptype, new_rules)?;
        let mut batch = ReplaceBatch::default();
        for (old, new) in olds.into_iter().zip(news) {
            if old.id == new.id {
                continue;
            }
            // A later pair may remove a row an earlier pair inserted.
            batch.insert.retain(|pending| pending.id != old.id);
            batch.remove.push(Selector::by_id(&old.id));
            if !batch.insert.iter().any(|pending| pending.id == new.id) {
                batch.insert.push(new);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        let changed = batch.insert.len();
        self.apply_update(cancel, "update", batch).await?;
        tracing::debug!(sec, ptype, changed, "updated policies");
        Ok(())
    }

    /// Remove every `ptype` rule matching the positional filter, store
    /// `new_rules`, and return the removed rules.
    ///
    /// # Errors
    /// - [`PolicyStoreError::PartialUpdate`] on a non-transactional backend
    ///   when a phase fails after earlier phases were applied.
    pub async fn update_filtered_policies<S: AsRef<str>, T: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        sec: &str,
        ptype: &str,
        new_rules: &[Vec<S>],
        field_index: usize,
        field_values: &[T],
    ) -> PolicyStoreResult<Vec<Vec<String>>> {
        let selector = Selector::from_indexed(field_index, field_values).with_ptype(ptype);
        let insert = to_rows(ptype, new_rules)?;
        let removed = self
            .apply_update(
                cancel,
                "update_filtered",
                ReplaceBatch {
                    remove: vec![selector],
                    insert,
                },
            )
            .await?;
        tracing::debug!(
            sec,
            ptype,
            field_index,
            removed = removed.len(),
            "updated filtered policies"
        );
        Ok(removed
            .iter()
            .map(|row| to_tokens(row).1)
            .collect())
    }

    /// Remove every stored rule of every ptype.
    pub async fn clear_policy(&self, cancel: &CancellationToken) -> PolicyStoreResult<()> {
        let removed = self
            .gateway
            .delete_by_selector(cancel, &Selector::all())
            .await?;
        record_removed("clear", removed as usize);
        tracing::debug!(removed, "cleared policy");
        Ok(())
    }

    async fn apply_update(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        batch: ReplaceBatch,
    ) -> PolicyStoreResult<Vec<RuleRow>> {
        if !self.gateway.supports_transactions() {
            tracing::warn!(
                backend = self.gateway.backend_name(),
                op,
                "backend lacks transactions; applying update without rollback"
            );
        }
        let written = batch.insert.len();
        let removed = self.gateway.replace(cancel, batch).await?;
        record_removed(op, removed.len());
        record_written(op, written);
        Ok(removed)
    }
}

/// Enforcer-facing surface. Each call runs with its own cancellation token
/// and reports success once the store accepted the change.
#[async_trait]
impl casbin::Adapter for DocstoreAdapter {
    async fn load_policy(&mut self, m: &mut dyn casbin::Model) -> casbin::Result<()> {
        let cancel = CancellationToken::new();
        DocstoreAdapter::load_policy(self, &cancel, &mut CasbinModel(m)).await?;
        Ok(())
    }

    /// `p` and `g` values are positional from `v0`; an empty value matches
    /// anything.
    async fn load_filtered_policy<'a>(
        &mut self,
        m: &mut dyn casbin::Model,
        f: CasbinFilter<'a>,
    ) -> casbin::Result<()> {
        let cancel = CancellationToken::new();
        let mut model = CasbinModel(m);
        let mut loaded = 0;
        for (sec, values) in [("p", &f.p), ("g", &f.g)] {
            let selector = Selector::from_indexed(0, values);
            loaded += self
                .load_into(&cancel, &selector, Some(sec), &mut model)
                .await?;
        }
        self.filtered.store(true, Ordering::SeqCst);
        tracing::debug!(loaded, "loaded filtered policy");
        Ok(())
    }

    async fn save_policy(&mut self, m: &mut dyn casbin::Model) -> casbin::Result<()> {
        let cancel = CancellationToken::new();
        DocstoreAdapter::save_policy(self, &cancel, &CasbinModel(m)).await?;
        Ok(())
    }

    async fn clear_policy(&mut self) -> casbin::Result<()> {
        DocstoreAdapter::clear_policy(self, &CancellationToken::new()).await?;
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        DocstoreAdapter::is_filtered(self)
    }

    async fn add_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> casbin::Result<bool> {
        DocstoreAdapter::add_policy(self, &CancellationToken::new(), sec, ptype, &rule).await?;
        Ok(true)
    }

    async fn add_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        DocstoreAdapter::add_policies(self, &CancellationToken::new(), sec, ptype, &rules).await?;
        Ok(true)
    }

    async fn remove_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> casbin::Result<bool> {
        DocstoreAdapter::remove_policy(self, &CancellationToken::new(), sec, ptype, &rule).await?;
        Ok(true)
    }

    async fn remove_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        DocstoreAdapter::remove_policies(self, &CancellationToken::new(), sec, ptype, &rules)
            .await?;
        Ok(true)
    }

    async fn remove_filtered_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> casbin::Result<bool> {
        DocstoreAdapter::remove_filtered_policy(
            self,
            &CancellationToken::new(),
            sec,
            ptype,
            field_index,
            &field_values,
        )
        .await?;
        Ok(true)
    }
}

fn record_written(op: &'static str, count: usize) {
    metrics::counter!("felix_policy_rows_written_total", "op" => op).increment(count as u64);
}

fn record_removed(op: &'static str, count: usize) {
    metrics::counter!("felix_policy_rows_removed_total", "op" => op).increment(count as u64);
}
