//! Pages served from JSON files on disk: `<dir>/page-<n>.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ihdp_core::{FetchedBatch, ParseError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{FetchError, SourceFetcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSpec {
    /// Relative paths resolve against the workspace root.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FixturePage {
    #[serde(default)]
    records: Vec<JsonValue>,
    has_more: Option<bool>,
    /// Simulates a failed fetch for this page.
    error: Option<String>,
}

pub struct FixtureFetcher {
    source_id: String,
    dir: PathBuf,
}

impl FixtureFetcher {
    pub fn new(source_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            dir: dir.into(),
        }
    }

    pub fn from_spec(source_id: impl Into<String>, spec: &FixtureSpec, workspace_root: &Path) -> Self {
        let dir = if spec.dir.is_absolute() {
            spec.dir.clone()
        } else {
            workspace_root.join(&spec.dir)
        };
        Self::new(source_id, dir)
    }

    fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("page-{page}.json"))
    }
}

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self, page: u32) -> Result<FetchedBatch, FetchError> {
        let path = self.page_path(page);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FetchedBatch::new(Vec::new(), false));
            }
            Err(source) => return Err(FetchError::Io { path, source }),
        };
        let fixture: FixturePage = serde_json::from_str(&text)
            .map_err(|err| FetchError::decode(path.display().to_string(), err.to_string()))?;
        if let Some(message) = fixture.error {
            return Err(FetchError::Message(message));
        }

        let has_more = match fixture.has_more {
            Some(has_more) => has_more,
            None => tokio::fs::try_exists(self.page_path(page + 1))
                .await
                .unwrap_or(false),
        };
        let mut batch = FetchedBatch::new(Vec::with_capacity(fixture.records.len()), has_more);
        for (index, record) in fixture.records.into_iter().enumerate() {
            match record {
                JsonValue::Object(fields) => batch.records.push(fields),
                other => batch
                    .rejected
                    .push(ParseError::malformed(index, format!("expected an object, got {other}"))),
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_pages_until_files_run_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("page-1.json"),
            r#"{"records": [{"id": "a", "ts": 3}, 7]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("page-2.json"),
            r#"{"records": [{"id": "b", "ts": 2}], "has_more": false}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("page-3.json"), r#"{"error": "gateway timeout"}"#).unwrap();

        let fetcher = FixtureFetcher::new("fixture", dir.path());
        let first = fetcher.fetch_batch(1).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.rejected.len(), 1);
        assert!(first.has_more);

        let second = fetcher.fetch_batch(2).await.unwrap();
        assert!(!second.has_more);

        assert!(matches!(
            fetcher.fetch_batch(3).await,
            Err(FetchError::Message(m)) if m == "gateway timeout"
        ));

        let missing = fetcher.fetch_batch(9).await.unwrap();
        assert!(missing.is_empty() && !missing.has_more);
    }

    #[test]
    fn relative_dirs_resolve_against_workspace_root() {
        let spec = FixtureSpec {
            dir: PathBuf::from("fixtures/demo"),
        };
        let fetcher = FixtureFetcher::from_spec("demo", &spec, Path::new("/srv/ihdp"));
        assert_eq!(fetcher.page_path(2), PathBuf::from("/srv/ihdp/fixtures/demo/page-2.json"));
    }
}
