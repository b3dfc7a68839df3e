//! Incremental load coordinator: mode decision, page loop, watermark upkeep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ihdp_adapters::{FetchError, SourceFetcher};
use ihdp_core::{
    CandidateRecord, FetchedBatch, LoadMode, NaturalKey, RecencyKey, RecordSchema, Watermark,
};
use ihdp_storage::{BackoffPolicy, Sink, StoreError, WatermarkStore};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Page budget for one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeLimits {
    pub page_limit: u32,
    /// Consecutive pages without survivors (empty, stale, or failed) that end the run.
    pub empty_page_threshold: u32,
    pub page_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPolicy {
    pub full: ModeLimits,
    pub incremental: ModeLimits,
    pub fetch_retry: BackoffPolicy,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            full: ModeLimits {
                page_limit: 1000,
                empty_page_threshold: 5,
                page_delay: Duration::from_secs(3),
            },
            incremental: ModeLimits {
                page_limit: 20,
                empty_page_threshold: 1,
                page_delay: Duration::from_secs(2),
            },
            fetch_retry: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

impl LoadPolicy {
    /// Sources whose pages are not recency-descending keep the FULL
    /// threshold: a stale page says nothing about the pages after it.
    pub fn limits(&self, mode: LoadMode, recency_ordered: bool) -> ModeLimits {
        match mode {
            LoadMode::Full => self.full,
            LoadMode::Incremental if recency_ordered => self.incremental,
            LoadMode::Incremental => ModeLimits {
                empty_page_threshold: self.full.empty_page_threshold,
                ..self.incremental
            },
        }
    }

    pub fn without_delays(mut self) -> Self {
        self.full.page_delay = Duration::ZERO;
        self.incremental.page_delay = Duration::ZERO;
        self.fetch_retry.base_delay = Duration::ZERO;
        self.fetch_retry.max_delay = Duration::ZERO;
        self
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    /// Raised before any fetch; nothing was mutated.
    #[error("{source_id}: watermark store or sink unreachable: {source}")]
    StoreUnavailable {
        source_id: String,
        #[source]
        source: StoreError,
    },
    #[error("{source_id}: {operation} failed: {source}")]
    Store {
        source_id: String,
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl LoadError {
    pub fn source_id(&self) -> &str {
        match self {
            LoadError::StoreUnavailable { source_id, .. } | LoadError::Store { source_id, .. } => {
                source_id
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeDecision {
    pub mode: LoadMode,
    /// Stored key; only used as a filter in INCREMENTAL mode.
    pub watermark_key: Option<RecencyKey>,
    pub previous_count: i64,
    pub forced: bool,
}

impl ModeDecision {
    pub fn force_full(self) -> Self {
        Self {
            mode: LoadMode::Full,
            forced: true,
            ..self
        }
    }
}

/// What one source run needs besides the stores.
pub struct SourceJob {
    pub fetcher: Box<dyn SourceFetcher>,
    pub schema: RecordSchema,
    pub recency_ordered: bool,
    /// Overrides the coordinator policy for this source.
    pub policy: Option<LoadPolicy>,
}

impl SourceJob {
    pub fn new(fetcher: Box<dyn SourceFetcher>, schema: RecordSchema) -> Self {
        Self {
            fetcher,
            schema,
            recency_ordered: true,
            policy: None,
        }
    }

    pub fn source_id(&self) -> &str {
        self.fetcher.source_id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub source_id: String,
    pub mode: LoadMode,
    pub forced_full: bool,
    pub watermark_before: Option<RecencyKey>,
    pub watermark_after: Option<RecencyKey>,
    pub pages_fetched: u32,
    pub fetch_errors: u32,
    pub records_seen: u64,
    pub parse_errors: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub inserted: u64,
    pub record_count: i64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn start(source_id: &str, decision: &ModeDecision) -> Self {
        let now = Utc::now();
        Self {
            source_id: source_id.to_string(),
            mode: decision.mode,
            forced_full: decision.forced,
            watermark_before: decision.watermark_key,
            watermark_after: decision.watermark_key,
            pages_fetched: 0,
            fetch_errors: 0,
            records_seen: 0,
            parse_errors: 0,
            stale: 0,
            duplicates: 0,
            inserted: 0,
            record_count: decision.previous_count,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }
}

pub struct Coordinator {
    policy: LoadPolicy,
    watermarks: Arc<dyn WatermarkStore>,
    sink: Arc<dyn Sink>,
}

impl Coordinator {
    pub fn new(
        policy: LoadPolicy,
        watermarks: Arc<dyn WatermarkStore>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            policy,
            watermarks,
            sink,
        }
    }

    pub fn policy(&self) -> &LoadPolicy {
        &self.policy
    }

    /// Read-only. FULL when the sink holds no rows for the source or no
    /// watermark exists, INCREMENTAL otherwise.
    pub async fn determine_mode(&self, source_id: &str) -> Result<ModeDecision, LoadError> {
        let unavailable = |source| LoadError::StoreUnavailable {
            source_id: source_id.to_string(),
            source,
        };
        let watermark = self.watermarks.get(source_id).await.map_err(unavailable)?;
        let rows = self.sink.row_count(source_id).await.map_err(unavailable)?;

        let decision = match watermark {
            Some(wm) => ModeDecision {
                mode: if rows > 0 {
                    LoadMode::Incremental
                } else {
                    LoadMode::Full
                },
                watermark_key: wm.max_recency_key,
                previous_count: wm.record_count,
                forced: false,
            },
            None => ModeDecision {
                mode: LoadMode::Full,
                watermark_key: None,
                previous_count: 0,
                forced: false,
            },
        };
        debug!(source_id, rows, mode = %decision.mode, "mode decided");
        Ok(decision)
    }

    /// Decide the mode (optionally forcing FULL) and run the source.
    pub async fn load(
        &self,
        job: &SourceJob,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<RunReport, LoadError> {
        let mut decision = self.determine_mode(job.source_id()).await?;
        if force_full {
            decision = decision.force_full();
        }
        self.run(job, &decision, cancel).await
    }

    pub async fn run(
        &self,
        job: &SourceJob,
        decision: &ModeDecision,
        cancel: &CancellationToken,
    ) -> Result<RunReport, LoadError> {
        let span = info_span!("load_run", source_id = %job.source_id(), mode = %decision.mode);
        self.run_pages(job, decision, cancel).instrument(span).await
    }

    async fn run_pages(
        &self,
        job: &SourceJob,
        decision: &ModeDecision,
        cancel: &CancellationToken,
    ) -> Result<RunReport, LoadError> {
        let source_id = job.source_id();
        let policy = job.policy.as_ref().unwrap_or(&self.policy);
        let limits = policy.limits(decision.mode, job.recency_ordered);
        let filter_key = match decision.mode {
            LoadMode::Incremental => decision.watermark_key,
            LoadMode::Full => None,
        };

        let mut report = RunReport::start(source_id, decision);
        let mut observed_key = decision.watermark_key;
        let mut committed_key = decision.watermark_key;
        let mut consecutive_unproductive = 0u32;
        let mut page = 1u32;
        info!(
            watermark = ?decision.watermark_key,
            page_limit = limits.page_limit,
            empty_page_threshold = limits.empty_page_threshold,
            forced = decision.forced,
            "starting load"
        );

        while page <= limits.page_limit && consecutive_unproductive < limits.empty_page_threshold {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let fetched = self
                .fetch_with_retry(job.fetcher.as_ref(), page, &policy.fetch_retry, cancel)
                .await;
            report.pages_fetched += 1;
            let (batch, reached_end) = match fetched {
                Ok(batch) => {
                    let reached_end = !batch.has_more;
                    (batch, reached_end)
                }
                Err(err) => {
                    warn!(page, error = %err, "page fetch failed after retries; treating as empty");
                    report.fetch_errors += 1;
                    (FetchedBatch::default(), false)
                }
            };

            let filtered = self.filter_batch(job, batch, filter_key, &mut report);
            let page_max = filtered.max_key;
            let survivors =
                match without_existing(self.sink.as_ref(), source_id, filtered.records).await {
                    Ok((kept, already_stored)) => {
                        report.duplicates += already_stored;
                        kept
                    }
                    Err(source) => {
                        return Err(self
                            .fail(source_id, committed_key, &report, "filter_existing", source)
                            .await)
                    }
                };

            let inserted = if survivors.is_empty() {
                0
            } else {
                match self.sink.insert_many(source_id, &survivors).await {
                    Ok(inserted) => inserted,
                    Err(source) => {
                        return Err(self
                            .fail(source_id, committed_key, &report, "insert_many", source)
                            .await)
                    }
                }
            };
            // Constraint violations surface as rows not inserted.
            report.duplicates += (survivors.len() as u64).saturating_sub(inserted);
            report.inserted += inserted;
            report.record_count = decision.previous_count + report.inserted as i64;

            if survivors.is_empty() {
                consecutive_unproductive += 1;
            } else {
                consecutive_unproductive = 0;
                observed_key = observed_key.max(page_max);
            }

            if inserted > 0 {
                let watermark = Watermark::completed(source_id, observed_key, report.record_count);
                if let Err(source) = self.watermarks.upsert(&watermark).await {
                    return Err(self
                        .fail(source_id, committed_key, &report, "watermark upsert", source)
                        .await);
                }
                committed_key = observed_key;
            }
            info!(
                page,
                inserted,
                total_inserted = report.inserted,
                unproductive = consecutive_unproductive,
                "page processed"
            );

            if reached_end {
                debug!(page, "source reported no further pages");
                break;
            }
            page += 1;
            if !limits.page_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(limits.page_delay) => {}
                }
            }
        }

        report.finished_at = Utc::now();
        report.watermark_after = observed_key;
        if report.cancelled {
            report.watermark_after = committed_key;
            warn!(pages = report.pages_fetched, inserted = report.inserted, "load cancelled");
            return Ok(report);
        }

        let watermark = Watermark::completed(source_id, observed_key, report.record_count);
        if let Err(source) = self.watermarks.upsert(&watermark).await {
            return Err(self
                .fail(source_id, committed_key, &report, "watermark upsert", source)
                .await);
        }
        info!(
            pages = report.pages_fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            stale = report.stale,
            parse_errors = report.parse_errors,
            watermark = ?observed_key,
            "load completed"
        );
        Ok(report)
    }

    /// Parse, drop stale records, dedup within the batch and against the sink.
    fn filter_batch(
        &self,
        job: &SourceJob,
        batch: FetchedBatch,
        filter_key: Option<RecencyKey>,
        report: &mut RunReport,
    ) -> Filtered {
        let mut rejected = batch.rejected.len() as u64;
        for err in &batch.rejected {
            debug!(error = %err, "record rejected by fetcher");
        }

        let mut candidates = Vec::with_capacity(batch.records.len());
        let mut first_error = batch.rejected.first().map(ToString::to_string);
        for (index, fields) in batch.records.into_iter().enumerate() {
            match job.schema.extract(index, fields) {
                Ok(candidate) => candidates.push(candidate),
                Err(err) => {
                    debug!(error = %err, "record skipped");
                    first_error.get_or_insert_with(|| err.to_string());
                    rejected += 1;
                }
            }
        }
        if let Some(first) = &first_error {
            warn!(rejected, first = %first, "records skipped on page");
        }
        report.parse_errors += rejected;
        report.records_seen += candidates.len() as u64;
        let max_key = candidates.iter().map(|c| c.recency_key).max();

        let before = candidates.len();
        if let Some(key) = filter_key {
            candidates.retain(|c| c.recency_key > key);
        }
        report.stale += (before - candidates.len()) as u64;

        let mut seen = HashSet::with_capacity(candidates.len());
        let before = candidates.len();
        candidates.retain(|c| seen.insert(c.natural_key.clone()));
        report.duplicates += (before - candidates.len()) as u64;

        Filtered {
            records: candidates,
            max_key,
        }
    }

    async fn fetch_with_retry(
        &self,
        fetcher: &dyn SourceFetcher,
        page: u32,
        backoff: &BackoffPolicy,
        cancel: &CancellationToken,
    ) -> Result<FetchedBatch, FetchError> {
        let mut attempt = 0;
        loop {
            match fetcher.fetch_batch(page).await {
                Ok(batch) => return Ok(batch),
                Err(err)
                    if err.is_retryable()
                        && attempt < backoff.max_retries
                        && !cancel.is_cancelled() =>
                {
                    warn!(
                        page,
                        attempt,
                        transient = err.is_transient(),
                        error = %err,
                        "fetch failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(err),
                        _ = tokio::time::sleep(backoff.delay_for_attempt(attempt)) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Record the failure without moving the key past the last committed batch.
    async fn fail(
        &self,
        source_id: &str,
        committed_key: Option<RecencyKey>,
        report: &RunReport,
        operation: &'static str,
        source: StoreError,
    ) -> LoadError {
        error!(operation, error = %source, inserted = report.inserted, "load failed");
        let watermark =
            Watermark::failed(source_id, committed_key, report.record_count, source.to_string());
        if let Err(err) = self.watermarks.upsert(&watermark).await {
            error!(error = %err, "could not record failed watermark");
        }
        LoadError::Store {
            source_id: source_id.to_string(),
            operation,
            source,
        }
    }
}

struct Filtered {
    records: Vec<CandidateRecord>,
    /// Max key over every parsed record of the page, stale ones included.
    max_key: Option<RecencyKey>,
}

/// Drop keys already present in the sink.
async fn without_existing(
    sink: &dyn Sink,
    source_id: &str,
    records: Vec<CandidateRecord>,
) -> Result<(Vec<CandidateRecord>, u64), StoreError> {
    if records.is_empty() {
        return Ok((records, 0));
    }
    let keys: HashSet<NaturalKey> = records.iter().map(|r| r.natural_key.clone()).collect();
    let existing = sink.filter_existing(source_id, &keys).await?;
    let before = records.len();
    let kept: Vec<_> = records
        .into_iter()
        .filter(|r| !existing.contains(&r.natural_key))
        .collect();
    let dropped = (before - kept.len()) as u64;
    Ok((kept, dropped))
}
