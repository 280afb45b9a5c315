//! In-memory rule collection.
//!
//! # Purpose
//! Implements [`RuleGateway`] over a `BTreeMap` keyed by row id and guarded by a
//! `tokio::sync::RwLock`. It exists for:
//! - local development and tests (no external dependencies)
//! - embedding a policy store where durability is not required
//!
//! # Durability and consistency
//! - **Not durable**: all rows are lost when the last handle is dropped.
//! - Gateways opened for the same collection name through one
//!   [`MemoryDriver`] share rows, so several adapters can observe each other.
//! - `replace` is transactional by default: the batch is staged on a copy of the
//!   collection and swapped in under the write lock, so readers see either the
//!   old or the new state. Opening with `?transactions=false` switches to the
//!   sequential fallback, which is how non-transactional stores behave.
//!
//! # Ordering
//! Scans return rows in id order, which is stable for a given collection state.
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use crate::filter::Selector;
use crate::gateway::{
    ReplaceBatch, RowStream, RuleGateway, cancellable_rows, ensure_live, replace_sequential,
};
use crate::row::RuleRow;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

type Collection = Arc<RwLock<BTreeMap<String, RuleRow>>>;

pub struct MemoryGateway {
    collection: String,
    key_field: String,
    transactional: bool,
    rows: Collection,
    /// Makes the next insert phase fail, for exercising rollback paths.
    #[cfg(test)]
    fail_next_insert: std::sync::atomic::AtomicBool,
}

impl MemoryGateway {
    /// Standalone, transactional collection not shared with any driver.
    pub fn new(collection: &str) -> Self {
        Self::with_rows(collection, "id", true, Collection::default())
    }

    fn with_rows(collection: &str, key_field: &str, transactional: bool, rows: Collection) -> Self {
        Self {
            collection: collection.to_string(),
            key_field: key_field.to_string(),
            transactional,
            rows,
            #[cfg(test)]
            fail_next_insert: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Same rows, but `replace` uses the sequential fallback.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    #[cfg(test)]
    pub(crate) fn fail_next_insert(&self) {
        self.fail_next_insert
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_failure(&self) -> PolicyStoreResult<()> {
        if self
            .fail_next_insert
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(PolicyStoreError::unavailable(anyhow::anyhow!(
                "injected insert failure"
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> PolicyStoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl RuleGateway for MemoryGateway {
    async fn load(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
    ) -> PolicyStoreResult<RowStream> {
        ensure_live(cancel)?;
        // Snapshot under the read lock so the scan never holds it across yields.
        let matched: Vec<PolicyStoreResult<RuleRow>> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| selector.matches(row))
            .cloned()
            .map(Ok)
            .collect();
        Ok(cancellable_rows(stream::iter(matched).boxed(), cancel.clone()))
    }

    async fn insert_one(&self, cancel: &CancellationToken, row: RuleRow) -> PolicyStoreResult<()> {
        ensure_live(cancel)?;
        self.injected_failure()?;
        let mut rows = self.rows.write().await;
        if rows.contains_key(&row.id) {
            return Err(PolicyStoreError::DuplicateKey(row.id));
        }
        rows.insert(row.id.clone(), row);
        Ok(())
    }

    async fn insert_many(
        &self,
        cancel: &CancellationToken,
        rows: Vec<RuleRow>,
    ) -> PolicyStoreResult<u64> {
        ensure_live(cancel)?;
        self.injected_failure()?;
        let mut stored = self.rows.write().await;
        let mut inserted = 0;
        for row in rows {
            if !stored.contains_key(&row.id) {
                stored.insert(row.id.clone(), row);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn delete_by_selector(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
    ) -> PolicyStoreResult<u64> {
        ensure_live(cancel)?;
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| !selector.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_many(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> PolicyStoreResult<u64> {
        ensure_live(cancel)?;
        let mut rows = self.rows.write().await;
        Ok(ids.iter().filter(|id| rows.remove(*id).is_some()).count() as u64)
    }

    async fn replace(
        &self,
        cancel: &CancellationToken,
        batch: ReplaceBatch,
    ) -> PolicyStoreResult<Vec<RuleRow>> {
        if !self.transactional {
            return replace_sequential(self, cancel, batch).await;
        }
        ensure_live(cancel)?;
        let mut rows = self.rows.write().await;
        let mut staged = rows.clone();

        let mut removed = Vec::new();
        for selector in &batch.remove {
            staged.retain(|_, row| {
                if selector.matches(row) {
                    removed.push(row.clone());
                    false
                } else {
                    true
                }
            });
        }

        // Any failure from here on drops `staged`, leaving `rows` untouched.
        self.injected_failure()?;
        for row in batch.insert {
            staged.entry(row.id.clone()).or_insert(row);
        }
        ensure_live(cancel)?;
        *rows = staged;
        Ok(removed)
    }

    async fn health_check(&self) -> PolicyStoreResult<()> {
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Opens `mem://<collection>[/<id_field>][?transactions=false]`.
///
/// Collections are created on first use and shared by every gateway this
/// driver opens for the same name.
#[derive(Default)]
pub struct MemoryDriver {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, url: &Url) -> PolicyStoreResult<MemoryGateway> {
        let collection = url
            .host_str()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PolicyStoreError::InvalidUrl("mem url needs a collection name".into()))?;
        let key_field = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .or_else(|| query_param(url, "id_field"))
            .unwrap_or_else(|| "id".to_string());
        let transactional = match query_param(url, "transactions").as_deref() {
            None | Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(PolicyStoreError::InvalidUrl(format!(
                    "transactions must be true or false, got {other:?}"
                )));
            }
        };

        let rows = self
            .collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .clone();
        tracing::debug!(collection, key_field = %key_field, transactional, "opened memory collection");
        Ok(MemoryGateway::with_rows(
            collection,
            &key_field,
            transactional,
            rows,
        ))
    }
}

pub(crate) fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
