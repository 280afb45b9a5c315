//! MongoDB-backed rule collection.
//!
//! # What this module is
//! Implements [`RuleGateway`] over a MongoDB collection. Each rule is one
//! document:
//!
//! ```text
//! { <key_field>: "<row id>", ptype: "p", v0: "alice", v1: "data1", v2: "read" }
//! ```
//!
//! Empty value columns are omitted from the document rather than stored as
//! empty strings.
//!
//! # Key invariants
//! - The key field (default `_id`) holds the derived row id and is unique. When
//!   a custom `id_field` is configured, a unique index on it is created at open.
//! - Selector values that are empty match documents where the column is
//!   absent.
//!
//! # Transactions
//! Multi-document transactions need a replica set or sharded cluster. At open
//! we ask the server (`hello`) which topology it is; standalone servers fall
//! back to the sequential replace path.
//!
//! # Security notes
//! - Server URLs may contain credentials; never log them.
use super::memory::query_param;
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use crate::filter::Selector;
use crate::gateway::{
    ReplaceBatch, RowStream, RuleGateway, cancellable_rows, ensure_live, replace_sequential,
    run_cancellable,
};
use crate::row::{RowField, RuleRow};
use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::{BulkWriteFailure, ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, InsertManyOptions, ReplaceOptions};
use mongodb::{Client, ClientSession, Collection, IndexModel};
use tokio_util::sync::CancellationToken;
use url::Url;

const DUPLICATE_KEY: i32 = 11000;
const DEFAULT_KEY_FIELD: &str = "_id";

pub struct MongoGateway {
    client: Client,
    database: String,
    collection: Collection<Document>,
    key_field: String,
    transactional: bool,
}

impl MongoGateway {
    /// Connect to `server_url` and bind to `database.collection`.
    ///
    /// # Errors
    /// - [`PolicyStoreError::StoreUnavailable`] when the server cannot be
    ///   reached or the key index cannot be created.
    pub async fn connect(
        server_url: &str,
        database: &str,
        collection: &str,
        key_field: &str,
    ) -> PolicyStoreResult<Self> {
        let client = Client::with_uri_str(server_url)
            .await
            .map_err(PolicyStoreError::unavailable)?;

        let hello = client
            .database("admin")
            .run_command(doc! { "hello": 1 }, None)
            .await
            .map_err(PolicyStoreError::unavailable)?;
        let transactional = hello.contains_key("setName")
            || hello.get_str("msg").map(|msg| msg == "isdbgrid").unwrap_or(false);

        let handle = client.database(database).collection::<Document>(collection);
        if key_field != DEFAULT_KEY_FIELD {
            let mut keys = Document::new();
            keys.insert(key_field, 1);
            let index = IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build();
            handle
                .create_index(index, None)
                .await
                .map_err(PolicyStoreError::unavailable)?;
        }

        tracing::debug!(database, collection, key_field, transactional, "opened mongo collection");
        Ok(Self {
            client,
            database: database.to_string(),
            collection: handle,
            key_field: key_field.to_string(),
            transactional,
        })
    }

    async fn replace_in_session(
        &self,
        session: &mut ClientSession,
        batch: &ReplaceBatch,
    ) -> PolicyStoreResult<Vec<RuleRow>> {
        let mut removed: Vec<RuleRow> = Vec::new();
        for selector in &batch.remove {
            let filter = filter_document(&self.key_field, selector);
            let mut cursor = self
                .collection
                .find_with_session(filter.clone(), None, session)
                .await
                .map_err(PolicyStoreError::unavailable)?;
            while let Some(document) = cursor.next(session).await {
                let document = document.map_err(PolicyStoreError::unavailable)?;
                let row = row_from_document(&self.key_field, &document)?;
                if !removed.iter().any(|seen| seen.id == row.id) {
                    removed.push(row);
                }
            }
            self.collection
                .delete_many_with_session(filter, None, session)
                .await
                .map_err(PolicyStoreError::unavailable)?;
        }

        // Upserts keep the insert phase idempotent; a plain insert of a row that
        // already exists would abort the whole transaction.
        for row in &batch.insert {
            let mut key = Document::new();
            key.insert(self.key_field.as_str(), row.id.as_str());
            let options = ReplaceOptions::builder().upsert(true).build();
            self.collection
                .replace_one_with_session(
                    key,
                    to_document(&self.key_field, row),
                    options,
                    session,
                )
                .await
                .map_err(PolicyStoreError::unavailable)?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl RuleGateway for MongoGateway {
    async fn load(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
    ) -> PolicyStoreResult<RowStream> {
        let filter = filter_document(&self.key_field, selector);
        let cursor = run_cancellable(cancel, async {
            self.collection
                .find(filter, None)
                .await
                .map_err(PolicyStoreError::unavailable)
        })
        .await?;
        let key_field = self.key_field.clone();
        let rows = cursor
            .map(move |document| {
                document
                    .map_err(PolicyStoreError::unavailable)
                    .and_then(|document| row_from_document(&key_field, &document))
            })
            .boxed();
        Ok(cancellable_rows(rows, cancel.clone()))
    }

    async fn insert_one(&self, cancel: &CancellationToken, row: RuleRow) -> PolicyStoreResult<()> {
        let document = to_document(&self.key_field, &row);
        run_cancellable(cancel, async {
            match self.collection.insert_one(document, None).await {
                Ok(_) => Ok(()),
                Err(err) if is_duplicate_key(&err) => Err(PolicyStoreError::DuplicateKey(row.id)),
                Err(err) => Err(PolicyStoreError::unavailable(err)),
            }
        })
        .await
    }

    async fn insert_many(
        &self,
        cancel: &CancellationToken,
        rows: Vec<RuleRow>,
    ) -> PolicyStoreResult<u64> {
        ensure_live(cancel)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let documents: Vec<Document> = rows
            .iter()
            .map(|row| to_document(&self.key_field, row))
            .collect();
        // Unordered so one duplicate does not stop the rest of the batch.
        let options = InsertManyOptions::builder().ordered(false).build();
        let total = documents.len() as u64;
        run_cancellable(cancel, async {
            match self.collection.insert_many(documents, options).await {
                Ok(result) => Ok(result.inserted_ids.len() as u64),
                Err(err) => {
                    if let ErrorKind::BulkWrite(failure) = err.kind.as_ref() {
                        if only_duplicates(failure) {
                            let skipped = failure.write_errors.as_ref().map_or(0, Vec::len);
                            return Ok(total - skipped as u64);
                        }
                    }
                    Err(PolicyStoreError::unavailable(err))
                }
            }
        })
        .await
    }

    async fn delete_by_selector(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
    ) -> PolicyStoreResult<u64> {
        let filter = filter_document(&self.key_field, selector);
        run_cancellable(cancel, async {
            self.collection
                .delete_many(filter, None)
                .await
                .map(|result| result.deleted_count)
                .map_err(PolicyStoreError::unavailable)
        })
        .await
    }

    async fn delete_many(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> PolicyStoreResult<u64> {
        ensure_live(cancel)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut filter = Document::new();
        filter.insert(self.key_field.as_str(), doc! { "$in": ids.to_vec() });
        run_cancellable(cancel, async {
            self.collection
                .delete_many(filter, None)
                .await
                .map(|result| result.deleted_count)
                .map_err(PolicyStoreError::unavailable)
        })
        .await
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
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(PolicyStoreError::unavailable)?;
        session
            .start_transaction(None)
            .await
            .map_err(PolicyStoreError::unavailable)?;

        let outcome = run_cancellable(cancel, self.replace_in_session(&mut session, &batch)).await;
        match outcome {
            Ok(removed) => {
                session
                    .commit_transaction()
                    .await
                    .map_err(PolicyStoreError::unavailable)?;
                Ok(removed)
            }
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!(error = %abort_err, "failed to abort replace transaction");
                }
                Err(err)
            }
        }
    }

    async fn health_check(&self) -> PolicyStoreResult<()> {
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map(|_| ())
            .map_err(PolicyStoreError::unavailable)
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "mongo"
    }
}

/// Opens `mongo://<database>/<collection>[?id_field=<field>]` against a fixed
/// server address.
pub struct MongoDriver {
    server_url: String,
}

impl MongoDriver {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub async fn open(&self, url: &Url) -> PolicyStoreResult<MongoGateway> {
        let database = url
            .host_str()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PolicyStoreError::InvalidUrl("mongo url needs a database".into()))?;
        let collection = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| PolicyStoreError::InvalidUrl("mongo url needs a collection".into()))?;
        let key_field =
            query_param(url, "id_field").unwrap_or_else(|| DEFAULT_KEY_FIELD.to_string());
        MongoGateway::connect(&self.server_url, database, collection, &key_field).await
    }
}

fn field_name<'a>(key_field: &'a str, field: RowField) -> &'a str {
    match field {
        RowField::Id => key_field,
        other => other.name(),
    }
}

pub(crate) fn to_document(key_field: &str, row: &RuleRow) -> Document {
    let mut document = Document::new();
    document.insert(key_field, row.id.as_str());
    document.insert("ptype", row.ptype.as_str());
    for (index, value) in row.values().into_iter().enumerate() {
        if let Some(field) = RowField::value(index).filter(|_| !value.is_empty()) {
            document.insert(field.name(), value);
        }
    }
    document
}

pub(crate) fn row_from_document(key_field: &str, document: &Document) -> PolicyStoreResult<RuleRow> {
    let text = |name: &str| -> PolicyStoreResult<String> {
        match document.get(name) {
            Some(Bson::String(value)) => Ok(value.clone()),
            None | Some(Bson::Null) => Ok(String::new()),
            Some(other) => Err(PolicyStoreError::unavailable(anyhow::anyhow!(
                "rule document field {name} has unexpected type {:?}",
                other.element_type()
            ))),
        }
    };
    let mut row = RuleRow {
        id: text(key_field)?,
        ptype: text("ptype")?,
        ..RuleRow::default()
    };
    for (index, slot) in row.values_mut().into_iter().enumerate() {
        if let Some(field) = RowField::value(index) {
            *slot = text(field.name())?;
        }
    }
    if row.id.is_empty() {
        return Err(PolicyStoreError::unavailable(anyhow::anyhow!(
            "rule document is missing {key_field}"
        )));
    }
    Ok(row)
}

pub(crate) fn filter_document(key_field: &str, selector: &Selector) -> Document {
    let mut filter = Document::new();
    for (field, accepted) in selector.constraints() {
        // Empty columns are omitted on write, so "" has to match a missing field.
        let mut values: Vec<Bson> = accepted
            .iter()
            .map(|value| {
                if value.is_empty() {
                    Bson::Null
                } else {
                    Bson::String(value.clone())
                }
            })
            .collect();
        let condition = if values.len() == 1 {
            values.remove(0)
        } else {
            Bson::Document(doc! { "$in": values })
        };
        filter.insert(field_name(key_field, field), condition);
    }
    filter
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == DUPLICATE_KEY,
        ErrorKind::BulkWrite(failure) => only_duplicates(failure),
        _ => false,
    }
}

fn only_duplicates(failure: &BulkWriteFailure) -> bool {
    failure.write_concern_error.is_none()
        && failure
            .write_errors
            .as_ref()
            .map(|errors| errors.iter().all(|error| error.code == DUPLICATE_KEY))
            .unwrap_or(false)
}
