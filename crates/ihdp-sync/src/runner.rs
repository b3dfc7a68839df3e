//! Multi-source runs: one coordinator run per selected source, bounded
//! concurrency, one summary per invocation.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ihdp_adapters::build_fetcher;
use ihdp_storage::{HttpFetcher, Sink, WatermarkStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::coordinator::{Coordinator, LoadError, RunReport, SourceJob};
use crate::registry::{SourceConfig, SourceRegistry, SourceSelection};
use crate::report;

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub selection: SourceSelection,
    pub force_full: bool,
    /// Recorded in the summary; the caller decides which stores back the run.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub display_name: String,
    pub status: SourceStatus,
    pub report: Option<RunReport>,
    pub error: Option<String>,
}

impl SourceOutcome {
    fn failed(source_id: &str, display_name: &str, error: String) -> Self {
        Self {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            status: SourceStatus::Failed,
            report: None,
            error: Some(error),
        }
    }

    fn from_result(
        source_id: &str,
        display_name: &str,
        result: Result<RunReport, LoadError>,
    ) -> Self {
        match result {
            Ok(report) => Self {
                source_id: source_id.to_string(),
                display_name: display_name.to_string(),
                status: if report.cancelled {
                    SourceStatus::Cancelled
                } else {
                    SourceStatus::Completed
                },
                report: Some(report),
                error: None,
            },
            Err(err) => Self::failed(source_id, display_name, err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub force_full: bool,
    pub sources: Vec<SourceOutcome>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.sources
            .iter()
            .filter(|s| s.status == SourceStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn total_inserted(&self) -> u64 {
        self.sources
            .iter()
            .filter_map(|s| s.report.as_ref())
            .map(|r| r.inserted)
            .sum()
    }
}

pub struct EtlRunner {
    config: EtlConfig,
    registry: SourceRegistry,
    coordinator: Arc<Coordinator>,
    http: Arc<HttpFetcher>,
}

impl EtlRunner {
    pub fn new(
        config: EtlConfig,
        registry: SourceRegistry,
        watermarks: Arc<dyn WatermarkStore>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let coordinator = Arc::new(Coordinator::new(config.load_policy(), watermarks, sink));
        Ok(Self {
            config,
            registry,
            coordinator,
            http,
        })
    }

    pub fn with_coordinator(mut self, coordinator: Coordinator) -> Self {
        self.coordinator = Arc::new(coordinator);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn job_for(&self, source: &SourceConfig) -> Result<SourceJob> {
        let fetcher = build_fetcher(
            &source.source_id,
            &source.fetcher,
            self.http.clone(),
            &self.config.workspace_root,
        )
        .with_context(|| format!("building {} fetcher", source.fetcher.kind()))?;
        Ok(SourceJob {
            fetcher,
            schema: source.schema(),
            recency_ordered: source.recency_ordered,
            policy: source.policy(self.coordinator.policy()),
        })
    }

    pub async fn run_once(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let selected = self.registry.select(&request.selection)?;
        info!(
            %run_id,
            sources = selected.len(),
            force_full = request.force_full,
            dry_run = request.dry_run,
            "etl run starting"
        );

        let limit = Arc::new(Semaphore::new(self.config.max_parallel_sources.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(selected.len());

        for source in &selected {
            let job = match self.job_for(source) {
                Ok(job) => job,
                Err(err) => {
                    error!(source_id = %source.source_id, error = %format!("{err:#}"), "source skipped");
                    outcomes.push(SourceOutcome::failed(
                        &source.source_id,
                        &source.display_name,
                        format!("{err:#}"),
                    ));
                    continue;
                }
            };
            let coordinator = self.coordinator.clone();
            let limit = limit.clone();
            let cancel = cancel.clone();
            let force_full = request.force_full;
            let display_name = source.display_name.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                let result = coordinator.load(&job, force_full, &cancel).await;
                SourceOutcome::from_result(job.source_id(), &display_name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => error!(error = %err, "source task aborted"),
            }
        }

        let finished: HashSet<String> = outcomes.iter().map(|o| o.source_id.clone()).collect();
        for source in selected
            .iter()
            .filter(|s| !finished.contains(&s.source_id))
        {
            outcomes.push(SourceOutcome::failed(
                &source.source_id,
                &source.display_name,
                "source task aborted".to_string(),
            ));
        }
        outcomes.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: request.dry_run,
            force_full: request.force_full,
            sources: outcomes,
            reports_dir: None,
        };
        let reports_dir = report::write_reports(&self.config.reports_path(), &summary).await?;
        summary.reports_dir = Some(reports_dir.display().to_string());

        for failed in summary.failed() {
            warn!(
                source_id = %failed.source_id,
                error = failed.error.as_deref().unwrap_or("unknown"),
                "source failed"
            );
        }
        info!(
            %run_id,
            inserted = summary.total_inserted(),
            failed = summary.failed().count(),
            reports_dir = %reports_dir.display(),
            "etl run finished"
        );
        Ok(summary)
    }
}
