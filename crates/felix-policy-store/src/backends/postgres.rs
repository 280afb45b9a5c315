//! Postgres-backed rule collection.
//!
//! # What this module is
//! Implements [`RuleGateway`] over a single `casbin_rule` table (see
//! `migrations/`). Columns mirror the rule row: `id` primary key, `ptype`, and
//! `v0..v5` stored as `''` when unused.
//!
//! # Consistency / atomicity
//! Postgres gives us multi-statement transactions, so `replace` deletes and
//! inserts inside one transaction. Inserts use `ON CONFLICT (id) DO NOTHING`,
//! which keeps batch inserts idempotent without aborting the transaction.
//!
//! # Operational notes
//! - Migrations run at connect so the table exists before the first call.
//! - Pool size and acquire timeout come from [`PostgresConfig`]; hanging forever
//!   on an unavailable database is worse than failing the call.
//!
//! # Security notes
//! - Connection URLs may contain credentials; avoid logging them.
//! - Column names spliced into SQL come only from [`RowField::name`], a fixed
//!   allowlist. Values are always bound.
use crate::config::PostgresConfig;
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use crate::filter::Selector;
use crate::gateway::{ReplaceBatch, RowStream, RuleGateway, cancellable_rows, run_cancellable};
use crate::row::RuleRow;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COLUMNS: &str = "id, ptype, v0, v1, v2, v3, v4, v5";

// Eight bind parameters per row keeps a chunk well under the 65535 limit.
const INSERT_CHUNK: usize = 1_000;

/// Row shape for the `casbin_rule` table.
#[derive(Debug, Clone, FromRow)]
struct DbRule {
    id: String,
    ptype: String,
    v0: String,
    v1: String,
    v2: String,
    v3: String,
    v4: String,
    v5: String,
}

impl From<DbRule> for RuleRow {
    fn from(row: DbRule) -> Self {
        RuleRow {
            id: row.id,
            ptype: row.ptype,
            v0: row.v0,
            v1: row.v1,
            v2: row.v2,
            v3: row.v3,
            v4: row.v4,
            v5: row.v5,
        }
    }
}

impl From<sqlx::Error> for PolicyStoreError {
    fn from(err: sqlx::Error) -> Self {
        PolicyStoreError::unavailable(err)
    }
}

impl From<sqlx::migrate::MigrateError> for PolicyStoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        PolicyStoreError::unavailable(err)
    }
}

pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    /// Connect, then apply the embedded migrations.
    ///
    /// # Errors
    /// - [`PolicyStoreError::InvalidUrl`] when `url` is not a Postgres URL.
    /// - [`PolicyStoreError::StoreUnavailable`] on connection or migration
    ///   failure.
    pub async fn connect(url: &str, pg: &PostgresConfig) -> PolicyStoreResult<Self> {
        let connect_options = PgConnectOptions::from_str(url)
            .map_err(|err| PolicyStoreError::InvalidUrl(err.to_string()))?;
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn push_where(builder: &mut QueryBuilder<'_, Postgres>, selector: &Selector) {
    builder.push(" WHERE TRUE");
    for (field, accepted) in selector.constraints() {
        builder.push(" AND ");
        builder.push(field.name());
        builder.push(" = ANY(");
        builder.push_bind(accepted.iter().cloned().collect::<Vec<String>>());
        builder.push(")");
    }
}

fn select_query(selector: &Selector) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT {COLUMNS} FROM casbin_rule"));
    push_where(&mut builder, selector);
    builder.push(" ORDER BY id");
    builder
}

fn delete_query(selector: &Selector, returning: bool) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("DELETE FROM casbin_rule");
    push_where(&mut builder, selector);
    if returning {
        builder.push(format!(" RETURNING {COLUMNS}"));
    }
    builder
}

async fn insert_rows(conn: &mut PgConnection, rows: &[RuleRow]) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO casbin_rule ({COLUMNS}) "));
        builder.push_values(chunk, |mut values, row| {
            values.push_bind(row.id.as_str());
            values.push_bind(row.ptype.as_str());
            for value in row.values() {
                values.push_bind(value);
            }
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");
        inserted += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

#[async_trait]
impl RuleGateway for PostgresGateway {
    /// Rows are fetched in one round trip and then streamed from memory.
    async fn load(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
    ) -> PolicyStoreResult<RowStream> {
        let rows: Vec<DbRule> = run_cancellable(cancel, async {
            let mut query = select_query(selector);
            Ok(query.build_query_as::<DbRule>().fetch_all(&self.pool).await?)
        })
        .await?;
        let rows: Vec<PolicyStoreResult<RuleRow>> =
            rows.into_iter().map(|row| Ok(row.into())).collect();
        Ok(cancellable_rows(stream::iter(rows).boxed(), cancel.clone()))
    }

    async fn insert_one(&self, cancel: &CancellationToken, row: RuleRow) -> PolicyStoreResult<()> {
        run_cancellable(cancel, async {
            let values = row.values();
            let insert = sqlx::query(
                "INSERT INTO casbin_rule (id, ptype, v0, v1, v2, v3, v4, v5) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&row.id)
            .bind(&row.ptype)
            .bind(values[0])
            .bind(values[1])
            .bind(values[2])
            .bind(values[3])
            .bind(values[4])
            .bind(values[5])
            .execute(&self.pool)
            .await;
            match insert {
                Ok(_) => Ok(()),
                Err(err) if is_unique_violation(&err) => {
                    Err(PolicyStoreError::DuplicateKey(row.id.clone()))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn insert_many(
        &self,
        cancel: &CancellationToken,
        rows: Vec<RuleRow>,
    ) -> PolicyStoreResult<u64> {
        run_cancellable(cancel, async {
            if rows.is_empty() {
                return Ok(0);
            }
            let mut conn = self.pool.acquire().await?;
            Ok(insert_rows(&mut *conn, &rows).await?)
        })
        .await
    }

    async fn delete_by_selector(
        &self,
        cancel: &CancellationToken,
        selector: &Selector,
    ) -> PolicyStoreResult<u64> {
        run_cancellable(cancel, async {
            let mut query = delete_query(selector, false);
            Ok(query.build().execute(&self.pool).await?.rows_affected())
        })
        .await
    }

    async fn delete_many(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> PolicyStoreResult<u64> {
        run_cancellable(cancel, async {
            if ids.is_empty() {
                return Ok(0);
            }
            let result = sqlx::query("DELETE FROM casbin_rule WHERE id = ANY($1)")
                .bind(ids)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Delete and insert in one transaction. Dropping the transaction on error
    /// or cancellation rolls it back.
    async fn replace(
        &self,
        cancel: &CancellationToken,
        batch: ReplaceBatch,
    ) -> PolicyStoreResult<Vec<RuleRow>> {
        run_cancellable(cancel, async {
            let mut tx = self.pool.begin().await?;
            let mut removed: Vec<RuleRow> = Vec::new();
            for selector in &batch.remove {
                let mut query = delete_query(selector, true);
                let rows = query
                    .build_query_as::<DbRule>()
                    .fetch_all(&mut *tx)
                    .await?;
                removed.extend(rows.into_iter().map(RuleRow::from));
            }
            insert_rows(&mut *tx, &batch.insert).await?;
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }

    async fn health_check(&self) -> PolicyStoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// Opens `postgres://` / `postgresql://` URLs with shared pool settings.
pub struct PostgresDriver {
    config: PostgresConfig,
}

impl PostgresDriver {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    pub async fn open(&self, url: &str) -> PolicyStoreResult<PostgresGateway> {
        PostgresGateway::connect(url, &self.config).await
    }
}
