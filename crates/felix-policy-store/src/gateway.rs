//! Store-facing contract every backend implements.
//!
//! # Purpose
//! [`RuleGateway`] is the narrow set of document operations the policy adapter
//! needs: scan, insert, delete, and a batched replace. Backends live under
//! [`crate::backends`] and are normally obtained through the
//! [`crate::registry::DriverRegistry`].
//!
//! # Consistency
//! - `insert_one` reports collisions; `insert_many` treats them as already
//!   present.
//! - Deletes are idempotent: missing rows are not errors.
//! - `replace` is atomic only when [`RuleGateway::supports_transactions`] is
//!   true. The provided default is the sequential, best-effort fallback used by
//!   backends without multi-document transactions: a failure after the delete
//!   phase leaves the matched rows removed and surfaces
//!   [`PolicyStoreError::PartialUpdate`].
//!
//! # Cancellation
//! Every call takes a [`CancellationToken`]. Backends check it before issuing
//! store work and race it against in-flight calls via [`run_cancellable`];
//! scans are wrapped with [`cancellable_rows`] so long reads stop promptly.
use crate::errors::{PolicyStoreError, PolicyStoreResult, UpdatePhase};
use crate::filter::Selector;
use crate::row::RuleRow;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Lazy sequence of rows produced by a scan. Each call starts a fresh scan.
pub type RowStream = BoxStream<'static, PolicyStoreResult<RuleRow>>;

/// Rows to remove and rows to write as one unit.
#[derive(Debug, Clone, Default)]
pub struct ReplaceBatch {
    /// Every row matching any of these selectors is removed.
    pub remove: Vec<Selector>,
    /// Written after removal; rows already present are left as they are.
    pub insert: Vec<RuleRow>,
}

impl ReplaceBatch {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.insert.is_empty()
    }
}

#[async_trait]
pub trait RuleGateway: Send + Sync {
    /// Stream every row matching `selector` in store-native order.
    async fn load(&self, cancel: &CancellationToken, selector: &Selector)
    -> PolicyStoreResult<RowStream>;

    /// Insert a single row, failing with [`PolicyStoreError::DuplicateKey`]
    /// when its id already exists.
    async fn insert_one(&self, cancel: &CancellationToken, row: RuleRow) -> PolicyStoreResult<()>;

    /// Insert rows independently; duplicates are skipped. Returns how many rows
    /// were newly written.
    async fn insert_many(
        &self,
        cancel: &CancellationToken,
        rows: Vec<RuleRow>,
    ) -> PolicyStoreResult<u64>;

    /// Remove all rows matching `selector`; returns the number removed.
    async fn delete_by_selector(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
    ) -> PolicyStoreResult<u64>;

    /// Remove rows by id; unknown ids are ignored.
    async fn delete_many(&self, cancel: &CancellationToken, ids: &[String])
    -> PolicyStoreResult<u64>;

    /// Apply `batch` and return the rows it removed.
    ///
    /// Transactional backends override this with an all-or-nothing version.
    async fn replace(
        &self,
        cancel: &CancellationToken,
        batch: ReplaceBatch,
    ) -> PolicyStoreResult<Vec<RuleRow>> {
        replace_sequential(self, cancel, batch).await
    }

    /// Convenience scan of one ptype (or everything).
    async fn load_all(
        &self,
        cancel: &CancellationToken,
        ptype: Option<&str>,
    ) -> PolicyStoreResult<RowStream> {
        let selector = ptype.map(Selector::for_ptype).unwrap_or_default();
        self.load(cancel, &selector).await
    }

    async fn health_check(&self) -> PolicyStoreResult<()>;
    fn supports_transactions(&self) -> bool;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}

/// Best-effort replace for backends without multi-document transactions.
///
/// Matched rows are read first so they can be returned, then removed by id,
/// then the replacements are written. Nothing is rolled back.
pub async fn replace_sequential<G>(
    gateway: &G,
    cancel: &CancellationToken,
    batch: ReplaceBatch,
) -> PolicyStoreResult<Vec<RuleRow>>
where
    G: RuleGateway + ?Sized,
{
    let mut removed = Vec::new();
    for selector in &batch.remove {
        let rows: Vec<RuleRow> = gateway
            .load(cancel, selector)
            .await
            .map_err(|err| PolicyStoreError::partial(UpdatePhase::Delete, err))?
            .try_collect()
            .await
            .map_err(|err| PolicyStoreError::partial(UpdatePhase::Delete, err))?;
        for row in rows {
            if !removed.iter().any(|seen: &RuleRow| seen.id == row.id) {
                removed.push(row);
            }
        }
    }

    let ids: Vec<String> = removed.iter().map(|row| row.id.clone()).collect();
    if !ids.is_empty() {
        gateway
            .delete_many(cancel, &ids)
            .await
            .map_err(|err| PolicyStoreError::partial(UpdatePhase::Delete, err))?;
    }

    if !batch.insert.is_empty() {
        if let Err(err) = gateway.insert_many(cancel, batch.insert).await {
            tracing::warn!(
                backend = gateway.backend_name(),
                removed = removed.len(),
                error = %err,
                "replace lost its insert phase after deleting matched rows"
            );
            return Err(PolicyStoreError::partial(UpdatePhase::Insert, err));
        }
    }
    Ok(removed)
}

/// Fail fast when the caller already gave up.
pub fn ensure_live(cancel: &CancellationToken) -> PolicyStoreResult<()> {
    if cancel.is_cancelled() {
        return Err(PolicyStoreError::Canceled);
    }
    Ok(())
}

/// Race a store call against cancellation.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, call: F) -> PolicyStoreResult<T>
where
    F: Future<Output = PolicyStoreResult<T>>,
{
    ensure_live(cancel)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PolicyStoreError::Canceled),
        result = call => result,
    }
}

/// Wrap a scan so cancellation ends it with a single `Canceled` item.
pub fn cancellable_rows(rows: RowStream, cancel: CancellationToken) -> RowStream {
    stream::unfold(Some((rows, cancel)), |state| async move {
        let (mut rows, cancel) = state?;
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = rows.next() => Some(next),
        };
        match next {
            None => Some((Err(PolicyStoreError::Canceled), None)),
            Some(Some(item)) => Some((item, Some((rows, cancel)))),
            Some(None) => None,
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryGateway;
    use crate::codec::to_row;

    fn rows(count: usize) -> RowStream {
        let items: Vec<PolicyStoreResult<RuleRow>> = (0..count)
            .map(|index| to_row("p", &[format!("user{index}")]))
            .collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn cancellable_rows_passes_items_through() {
        let cancel = CancellationToken::new();
        let collected: Vec<RuleRow> = cancellable_rows(rows(3), cancel)
            .try_collect()
            .await
            .expect("rows");
        assert_eq!(collected.len(), 3);
    }

    #[tokio::test]
    async fn cancellable_rows_stops_after_cancel() {
        let cancel = CancellationToken::new();
        let mut scan = cancellable_rows(rows(3), cancel.clone());
        assert!(scan.next().await.expect("first").is_ok());
        cancel.cancel();
        let err = scan.next().await.expect("cancel item").unwrap_err();
        assert!(matches!(err, PolicyStoreError::Canceled));
        assert!(scan.next().await.is_none());
    }

    #[tokio::test]
    async fn load_all_scans_one_ptype_or_everything() {
        let gateway = MemoryGateway::new("casbin_rule");
        let cancel = CancellationToken::new();
        gateway
            .insert_many(
                &cancel,
                vec![
                    to_row("p", &["alice", "data1", "read"]).expect("row"),
                    to_row("p", &["bob", "data2", "write"]).expect("row"),
                    to_row("g", &["alice", "data2_admin"]).expect("row"),
                ],
            )
            .await
            .expect("seed");

        let policies: Vec<RuleRow> = gateway
            .load_all(&cancel, Some("p"))
            .await
            .expect("load p")
            .try_collect()
            .await
            .expect("rows");
        assert_eq!(policies.len(), 2);
        assert!(policies.iter().all(|row| row.ptype == "p"));

        let everything: Vec<RuleRow> = gateway
            .load_all(&cancel, None)
            .await
            .expect("load all")
            .try_collect()
            .await
            .expect("rows");
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn run_cancellable_rejects_cancelled_token() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_cancellable(&cancel, async { Ok::<_, PolicyStoreError>(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyStoreError::Canceled));
    }

    #[tokio::test]
    async fn run_cancellable_aborts_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = run_cancellable(&cancel, async {
            std::future::pending::<PolicyStoreResult<()>>().await
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PolicyStoreError::Canceled));
    }
}
