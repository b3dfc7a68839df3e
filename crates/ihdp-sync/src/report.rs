use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ihdp_core::Watermark;
use tokio::fs;

use crate::runner::{RunSummary, SourceStatus};

/// Writes `summary.json` and `summary.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(reports_dir.join("summary.md"), render_markdown(summary))
        .await
        .context("writing summary.md")?;

    Ok(reports_dir)
}

fn key_or_dash(key: Option<impl ToString>) -> String {
    key.map(|k| k.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn render_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Incremental load summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Forced full: {}", summary.force_full),
        format!("- Dry run: {}", summary.dry_run),
        format!("- Inserted: {}", summary.total_inserted()),
        String::new(),
        "| source | status | mode | pages | inserted | stale | duplicates | parse errors | watermark |".to_string(),
        "|---|---|---|---|---|---|---|---|---|".to_string(),
    ];

    for outcome in &summary.sources {
        let status = match outcome.status {
            SourceStatus::Completed => "completed",
            SourceStatus::Cancelled => "cancelled",
            SourceStatus::Failed => "failed",
        };
        match &outcome.report {
            Some(r) => lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} | {} -> {} |",
                outcome.source_id,
                status,
                r.mode,
                r.pages_fetched,
                r.inserted,
                r.stale,
                r.duplicates,
                r.parse_errors,
                key_or_dash(r.watermark_before),
                key_or_dash(r.watermark_after),
            )),
            None => lines.push(format!(
                "| {} | {} | - | - | - | - | - | - | - |",
                outcome.source_id, status
            )),
        }
    }

    let failures: Vec<_> = summary.failed().collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failed in failures {
            lines.push(format!(
                "- {}: {}",
                failed.source_id,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Plain-text table for `status`.
pub fn render_status(watermarks: &[Watermark]) -> String {
    if watermarks.is_empty() {
        return "no watermarks recorded".to_string();
    }
    let width = watermarks
        .iter()
        .map(|w| w.source_id.len())
        .max()
        .unwrap_or(0)
        .max("source".len());
    let mut lines = vec![format!(
        "{:<width$}  {:<9}  {:>14}  {:>10}  {:<25}  error",
        "source", "status", "max_key", "records", "last_run"
    )];
    for w in watermarks {
        lines.push(format!(
            "{:<width$}  {:<9}  {:>14}  {:>10}  {:<25}  {}",
            w.source_id,
            w.status.as_str(),
            key_or_dash(w.max_recency_key),
            w.record_count,
            w.last_run_at.format("%Y-%m-%d %H:%M:%S UTC"),
            w.last_error.as_deref().unwrap_or(""),
        ));
    }
    lines.join("\n")
}
