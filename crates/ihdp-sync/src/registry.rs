//! `sources.yaml`: which sources exist, where they land, how they are fetched.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ihdp_adapters::FetcherSpec;
use ihdp_core::RecordSchema;
use ihdp_storage::postgres::validate_table_name;
use serde::Deserialize;

use crate::coordinator::LoadPolicy;

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Bronze table, `schema.table`.
    pub table: String,
    pub recency_field: String,
    pub natural_key: Vec<String>,
    #[serde(default = "enabled_by_default")]
    pub recency_ordered: bool,
    pub fetcher: FetcherSpec,
    #[serde(default)]
    pub limits: LimitOverrides,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Per-source adjustments to the coordinator defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitOverrides {
    pub full_page_limit: Option<u32>,
    pub incremental_page_limit: Option<u32>,
    pub full_empty_pages: Option<u32>,
    pub incremental_empty_pages: Option<u32>,
    pub page_delay_secs: Option<f64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self.full_page_limit.is_none()
            && self.incremental_page_limit.is_none()
            && self.full_empty_pages.is_none()
            && self.incremental_empty_pages.is_none()
            && self.page_delay_secs.is_none()
    }
}

/// Which sources one invocation runs.
#[derive(Debug, Clone, Default)]
pub struct SourceSelection {
    /// Explicit source ids; these run even when disabled.
    pub source_ids: Vec<String>,
    pub group: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut tables = HashSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                bail!("source with empty source_id");
            }
            if !ids.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}`", source.source_id);
            }
            if !tables.insert(source.table.as_str()) {
                bail!("table `{}` is used by more than one source", source.table);
            }
            if source.natural_key.is_empty() {
                bail!("source `{}` has an empty natural_key", source.source_id);
            }
            validate_table_name(&source.table)
                .with_context(|| format!("source `{}`", source.source_id))?;
        }
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn select(&self, selection: &SourceSelection) -> Result<Vec<&SourceConfig>> {
        if !selection.source_ids.is_empty() {
            return selection
                .source_ids
                .iter()
                .map(|id| {
                    self.get(id)
                        .with_context(|| format!("unknown source `{id}`"))
                })
                .collect();
        }
        let selected: Vec<&SourceConfig> = self
            .sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| match &selection.group {
                Some(group) => s.groups.iter().any(|g| g == group),
                None => true,
            })
            .collect();
        if let Some(group) = &selection.group {
            if selected.is_empty() {
                bail!("no enabled source belongs to group `{group}`");
            }
        }
        Ok(selected)
    }
}

impl SourceConfig {
    pub fn schema(&self) -> RecordSchema {
        RecordSchema::new(self.recency_field.clone(), self.natural_key.iter().cloned())
    }

    /// `None` when the source keeps the coordinator defaults.
    pub fn policy(&self, base: &LoadPolicy) -> Option<LoadPolicy> {
        let limits = &self.limits;
        if limits.is_empty() {
            return None;
        }
        let mut policy = *base;
        if let Some(v) = limits.full_page_limit {
            policy.full.page_limit = v;
        }
        if let Some(v) = limits.incremental_page_limit {
            policy.incremental.page_limit = v;
        }
        if let Some(v) = limits.full_empty_pages {
            policy.full.empty_page_threshold = v.max(1);
        }
        if let Some(v) = limits.incremental_empty_pages {
            policy.incremental.empty_page_threshold = v.max(1);
        }
        if let Some(secs) = limits.page_delay_secs.filter(|s| s.is_finite() && *s >= 0.0) {
            policy.full.page_delay = Duration::from_secs_f64(secs);
            policy.incremental.page_delay = Duration::from_secs_f64(secs);
        }
        Some(policy)
    }
}
