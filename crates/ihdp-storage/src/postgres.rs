//! PostgreSQL-backed watermark store and bronze-layer sink.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ihdp_core::{CandidateRecord, NaturalKey, RecencyKey, Watermark, WatermarkStatus};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::warehouse::{Sink, StoreError, WatermarkStore};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 30,
        }
    }
}

pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(database_url)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))
}

/// Create the warehouse schemas and the watermark table.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Query(format!("running migrations: {err}")))
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Query(err.to_string()),
    }
}

/// Accepts `name` or `schema.name`, lowercase identifiers only; table names
/// are interpolated into SQL text.
pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid_ident = |ident: &str| {
        let mut chars = ident.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    let parts: Vec<&str> = table.split('.').collect();
    if (1..=2).contains(&parts.len()) && parts.iter().all(|p| valid_ident(p)) {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn watermark_from_row(row: &PgRow) -> Result<Watermark, StoreError> {
    let decode = |err: sqlx::Error| StoreError::Query(format!("decoding watermark row: {err}"));
    let status: String = row.try_get("status").map_err(decode)?;
    let max_recency_key: Option<i64> = row.try_get("max_recency_key").map_err(decode)?;
    let last_run_at: DateTime<Utc> = row.try_get("last_run_at").map_err(decode)?;
    Ok(Watermark {
        source_id: row.try_get("source_id").map_err(decode)?,
        max_recency_key: max_recency_key.map(RecencyKey),
        last_run_at,
        status: status
            .parse::<WatermarkStatus>()
            .map_err(StoreError::Query)?,
        record_count: row.try_get("record_count").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
    })
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, source_id: &str) -> Result<Option<Watermark>, StoreError> {
        let row = sqlx::query(
            "SELECT source_id, max_recency_key, last_run_at, status, record_count, last_error \
             FROM etl_watermarks WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(watermark_from_row).transpose()
    }

    async fn upsert(&self, watermark: &Watermark) -> Result<(), StoreError> {
        // GREATEST ignores NULL, so the stored key never moves backwards.
        sqlx::query(
            "INSERT INTO etl_watermarks \
                 (source_id, max_recency_key, last_run_at, status, record_count, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (source_id) DO UPDATE SET \
                 max_recency_key = GREATEST(etl_watermarks.max_recency_key, EXCLUDED.max_recency_key), \
                 last_run_at = EXCLUDED.last_run_at, \
                 status = EXCLUDED.status, \
                 record_count = EXCLUDED.record_count, \
                 last_error = EXCLUDED.last_error",
        )
        .bind(&watermark.source_id)
        .bind(watermark.max_recency_key.map(RecencyKey::value))
        .bind(watermark.last_run_at)
        .bind(watermark.status.as_str())
        .bind(watermark.record_count)
        .bind(&watermark.last_error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>, StoreError> {
        let rows = sqlx::query(
            "SELECT source_id, max_recency_key, last_run_at, status, record_count, last_error \
             FROM etl_watermarks ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(watermark_from_row).collect()
    }
}

/// Bronze sink: one table per source, natural key as primary key and the
/// mapped record kept as JSONB.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
    tables: HashMap<String, String>,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables: HashMap::new(),
        }
    }

    pub fn register(
        mut self,
        source_id: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        self.tables.insert(source_id.into(), table);
        Ok(self)
    }

    fn table_for(&self, source_id: &str) -> Result<&str, StoreError> {
        self.tables
            .get(source_id)
            .map(String::as_str)
            .ok_or_else(|| StoreError::UnknownSource(source_id.to_string()))
    }

    /// Create every registered bronze table that does not exist yet.
    pub async fn ensure_tables(&self) -> Result<(), StoreError> {
        for (source_id, table) in &self.tables {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {table} ( \
                     natural_key TEXT PRIMARY KEY, \
                     recency_key BIGINT NOT NULL, \
                     payload JSONB NOT NULL, \
                     ingested_at TIMESTAMPTZ NOT NULL DEFAULT now())"
            );
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            let index_name = format!("{}_recency_idx", table.replace('.', "_"));
            let index = format!(
                "CREATE INDEX IF NOT EXISTS {index_name} ON {table} (recency_key DESC)"
            );
            sqlx::query(&index)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            info!(source_id = %source_id, table = %table, "bronze table ready");
        }
        Ok(())
    }

    async fn insert_rows_individually(
        &self,
        table: &str,
        records: &[CandidateRecord],
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "INSERT INTO {table} (natural_key, recency_key, payload) VALUES ($1, $2, $3) \
             ON CONFLICT (natural_key) DO NOTHING"
        );
        let mut inserted = 0;
        for record in records {
            let result = sqlx::query(&sql)
                .bind(record.natural_key.to_storage_key())
                .bind(record.recency_key.value())
                .bind(JsonValue::Object(record.fields.clone()))
                .execute(&self.pool)
                .await;
            match result {
                Ok(done) => inserted += done.rows_affected(),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    warn!(table, natural_key = %record.natural_key, "constraint violation treated as duplicate");
                }
                Err(err) => return Err(map_sqlx_error(err)),
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn row_count(&self, source_id: &str) -> Result<u64, StoreError> {
        let table = self.table_for(source_id)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count.max(0) as u64)
    }

    async fn filter_existing(
        &self,
        source_id: &str,
        keys: &HashSet<NaturalKey>,
    ) -> Result<HashSet<NaturalKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let table = self.table_for(source_id)?;
        let encoded: Vec<String> = keys.iter().map(NaturalKey::to_storage_key).collect();
        let existing: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT natural_key FROM {table} WHERE natural_key = ANY($1)"
        ))
        .bind(&encoded)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(existing
            .iter()
            .map(|k| NaturalKey::from_storage_key(k))
            .collect())
    }

    async fn insert_many(
        &self,
        source_id: &str,
        records: &[CandidateRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let table = self.table_for(source_id)?;
        let keys: Vec<String> = records.iter().map(|r| r.natural_key.to_storage_key()).collect();
        let recency: Vec<i64> = records.iter().map(|r| r.recency_key.value()).collect();
        let payloads: Vec<JsonValue> = records
            .iter()
            .map(|r| JsonValue::Object(r.fields.clone()))
            .collect();

        let sql = format!(
            "INSERT INTO {table} (natural_key, recency_key, payload) \
             SELECT * FROM UNNEST($1::text[], $2::int8[], $3::jsonb[]) \
             ON CONFLICT (natural_key) DO NOTHING"
        );
        match sqlx::query(&sql)
            .bind(&keys)
            .bind(&recency)
            .bind(&payloads)
            .execute(&self.pool)
            .await
        {
            Ok(done) => Ok(done.rows_affected()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                warn!(source_id, table, "batch insert hit a constraint; retrying row by row");
                self.insert_rows_individually(table, records).await
            }
            Err(err) => Err(map_sqlx_error(err)),
        }
    }
}
