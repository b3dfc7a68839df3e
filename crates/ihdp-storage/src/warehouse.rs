//! Watermark store and sink contracts, plus in-memory implementations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ihdp_core::{CandidateRecord, NaturalKey, Watermark};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached. Always fatal for a run.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("no sink table registered for source `{0}`")]
    UnknownSource(String),
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, source_id: &str) -> Result<Option<Watermark>, StoreError>;

    /// Insert or replace the single watermark row of `watermark.source_id`.
    async fn upsert(&self, watermark: &Watermark) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Watermark>, StoreError>;
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn row_count(&self, source_id: &str) -> Result<u64, StoreError>;

    /// Subset of `keys` already stored for `source_id`.
    async fn filter_existing(
        &self,
        source_id: &str,
        keys: &HashSet<NaturalKey>,
    ) -> Result<HashSet<NaturalKey>, StoreError>;

    /// Append records; records whose natural key already exists are no-ops.
    /// Returns the number of rows actually inserted.
    async fn insert_many(
        &self,
        source_id: &str,
        records: &[CandidateRecord],
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    rows: Mutex<HashMap<String, Watermark>>,
    unavailable: AtomicBool,
    upserts: AtomicUsize,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermark(watermark: Watermark) -> Self {
        let mut rows = HashMap::new();
        rows.insert(watermark.source_id.clone(), watermark);
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory watermark store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, source_id: &str) -> Result<Option<Watermark>, StoreError> {
        self.check()?;
        Ok(self.rows.lock().await.get(source_id).cloned())
    }

    async fn upsert(&self, watermark: &Watermark) -> Result<(), StoreError> {
        self.check()?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.rows
            .lock()
            .await
            .insert(watermark.source_id.clone(), watermark.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>, StoreError> {
        self.check()?;
        let mut rows: Vec<_> = self.rows.lock().await.values().cloned().collect();
        rows.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(rows)
    }
}

/// In-memory sink keyed by natural key; used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, BTreeMap<NaturalKey, CandidateRecord>>>,
    unavailable: AtomicBool,
    /// Number of successful `insert_many` calls before the sink goes offline.
    fail_after_inserts: Mutex<Option<usize>>,
    insert_calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, source_id: &str, records: impl IntoIterator<Item = CandidateRecord>) {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(source_id.to_string()).or_default();
        for record in records {
            table.entry(record.natural_key.clone()).or_insert(record);
        }
    }

    pub async fn records(&self, source_id: &str) -> Vec<CandidateRecord> {
        self.tables
            .lock()
            .await
            .get(source_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn fail_after_inserts(&self, successful_calls: usize) {
        *self.fail_after_inserts.lock().await = Some(successful_calls);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory sink offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn row_count(&self, source_id: &str) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .await
            .get(source_id)
            .map(|t| t.len() as u64)
            .unwrap_or(0))
    }

    async fn filter_existing(
        &self,
        source_id: &str,
        keys: &HashSet<NaturalKey>,
    ) -> Result<HashSet<NaturalKey>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(source_id) else {
            return Ok(HashSet::new());
        };
        Ok(keys.iter().filter(|k| table.contains_key(*k)).cloned().collect())
    }

    async fn insert_many(
        &self,
        source_id: &str,
        records: &[CandidateRecord],
    ) -> Result<u64, StoreError> {
        self.check()?;
        if let Some(limit) = *self.fail_after_inserts.lock().await {
            if self.insert_calls.load(Ordering::SeqCst) >= limit {
                self.set_unavailable(true);
                return Err(StoreError::Unavailable("memory sink went offline".into()));
            }
        }
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let mut tables = self.tables.lock().await;
        let table = tables.entry(source_id.to_string()).or_default();
        let mut inserted = 0;
        for record in records {
            if !table.contains_key(&record.natural_key) {
                table.insert(record.natural_key.clone(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

/// Reads through to `base` and keeps every write in memory.
pub struct DryRunSink {
    base: Option<Arc<dyn Sink>>,
    staged: MemorySink,
}

impl DryRunSink {
    pub fn new(base: Option<Arc<dyn Sink>>) -> Self {
        Self {
            base,
            staged: MemorySink::new(),
        }
    }

    /// Records a real run would have inserted.
    pub async fn staged(&self, source_id: &str) -> Vec<CandidateRecord> {
        self.staged.records(source_id).await
    }
}

#[async_trait]
impl Sink for DryRunSink {
    async fn row_count(&self, source_id: &str) -> Result<u64, StoreError> {
        let base = match &self.base {
            Some(base) => base.row_count(source_id).await?,
            None => 0,
        };
        Ok(base + self.staged.row_count(source_id).await?)
    }

    async fn filter_existing(
        &self,
        source_id: &str,
        keys: &HashSet<NaturalKey>,
    ) -> Result<HashSet<NaturalKey>, StoreError> {
        let mut present = self.staged.filter_existing(source_id, keys).await?;
        if let Some(base) = &self.base {
            present.extend(base.filter_existing(source_id, keys).await?);
        }
        Ok(present)
    }

    async fn insert_many(
        &self,
        source_id: &str,
        records: &[CandidateRecord],
    ) -> Result<u64, StoreError> {
        let Some(base) = &self.base else {
            return self.staged.insert_many(source_id, records).await;
        };
        let keys: HashSet<NaturalKey> = records.iter().map(|r| r.natural_key.clone()).collect();
        let stored = base.filter_existing(source_id, &keys).await?;
        let fresh: Vec<CandidateRecord> = records
            .iter()
            .filter(|r| !stored.contains(&r.natural_key))
            .cloned()
            .collect();
        self.staged.insert_many(source_id, &fresh).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ihdp_core::{RecencyKey, WatermarkStatus};

    fn candidate(id: &str, key: i64) -> CandidateRecord {
        CandidateRecord {
            natural_key: NaturalKey::new([id]),
            recency_key: RecencyKey(key),
            fields: Default::default(),
        }
    }

    #[tokio::test]
    async fn memory_sink_ignores_existing_keys_on_insert() {
        let sink = MemorySink::new();
        let first = sink
            .insert_many("daft", &[candidate("a", 1), candidate("b", 2)])
            .await
            .unwrap();
        let second = sink
            .insert_many("daft", &[candidate("b", 2), candidate("c", 3)])
            .await
            .unwrap();
        assert_eq!((first, second), (2, 1));
        assert_eq!(sink.row_count("daft").await.unwrap(), 3);
        assert_eq!(sink.row_count("cso-rent").await.unwrap(), 0);

        let probe: HashSet<_> = [NaturalKey::new(["a"]), NaturalKey::new(["z"])].into();
        let existing = sink.filter_existing("daft", &probe).await.unwrap();
        assert_eq!(existing, [NaturalKey::new(["a"])].into());
    }

    #[tokio::test]
    async fn memory_watermark_store_upserts_one_row_per_source() {
        let store = MemoryWatermarkStore::new();
        store
            .upsert(&Watermark::completed("daft", Some(RecencyKey(10)), 5))
            .await
            .unwrap();
        store
            .upsert(&Watermark::failed("daft", Some(RecencyKey(10)), 5, "boom"))
            .await
            .unwrap();
        let rows = store.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, WatermarkStatus::Failed);
        assert_eq!(rows[0].last_error.as_deref(), Some("boom"));

        store.set_unavailable(true);
        assert!(matches!(
            store.get("daft").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn dry_run_sink_counts_base_rows_but_never_writes_to_them() {
        let base = Arc::new(MemorySink::new());
        base.seed("ppr", [candidate("a", 1)]).await;
        let dry = DryRunSink::new(Some(base.clone()));

        assert_eq!(dry.row_count("ppr").await.unwrap(), 1);
        let inserted = dry
            .insert_many("ppr", &[candidate("a", 1), candidate("b", 2)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(dry.row_count("ppr").await.unwrap(), 2);
        assert_eq!(base.records("ppr").await.len(), 1);
        assert_eq!(dry.staged("ppr").await[0].natural_key, NaturalKey::new(["b"]));

        let probe: HashSet<_> = [NaturalKey::new(["a"]), NaturalKey::new(["b"])].into();
        assert_eq!(dry.filter_existing("ppr", &probe).await.unwrap(), probe);
    }
}
