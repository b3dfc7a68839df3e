//! Source fetcher contract + configurable fetchers (paged JSON/HTML, CSV,
//! SDMX-JSON, on-disk fixtures).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ihdp_core::FetchedBatch;
use ihdp_storage::{HttpError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod csv_table;
pub mod fixture;
pub mod json_pages;
pub mod mapping;
pub mod sdmx;

pub use csv_table::{CsvFetcher, CsvSpec};
pub use fixture::{FixtureFetcher, FixtureSpec};
pub use json_pages::{JsonPagesFetcher, JsonPagesSpec};
pub use mapping::{FieldMapping, Transform};
pub use sdmx::{SdmxFetcher, SdmxSeries, SdmxSpec};

pub const CRATE_NAME: &str = "ihdp-adapters";

/// A failed fetch call, distinct from an empty-but-successful page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding {what}: {reason}")]
    Decode { what: String, reason: String },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid fetcher configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
}

impl FetchError {
    pub fn decode(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Http(err) if err.is_timeout())
    }

    /// Network trouble, server errors, throttling. Logged with each failure.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(err) => err.is_transient(),
            FetchError::Io { .. } | FetchError::Message(_) => true,
            FetchError::Decode { .. } | FetchError::Config(_) => false,
        }
    }

    /// Everything except a broken configuration, undecodable bodies included.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Config(_))
    }
}

/// Pull-based producer of record batches for one source. Pages are 1-based.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_batch(&self, page: u32) -> Result<FetchedBatch, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetcherSpec {
    JsonPages(JsonPagesSpec),
    Csv(CsvSpec),
    SdmxJson(SdmxSpec),
    Fixture(FixtureSpec),
}

impl FetcherSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            FetcherSpec::JsonPages(_) => "json_pages",
            FetcherSpec::Csv(_) => "csv",
            FetcherSpec::SdmxJson(_) => "sdmx_json",
            FetcherSpec::Fixture(_) => "fixture",
        }
    }

    /// Fixture fetchers never touch the network.
    pub fn is_offline(&self) -> bool {
        matches!(self, FetcherSpec::Fixture(_))
    }
}

pub fn build_fetcher(
    source_id: &str,
    spec: &FetcherSpec,
    http: Arc<HttpFetcher>,
    workspace_root: &Path,
) -> Result<Box<dyn SourceFetcher>, FetchError> {
    let fetcher: Box<dyn SourceFetcher> = match spec {
        FetcherSpec::JsonPages(spec) => {
            Box::new(JsonPagesFetcher::new(source_id, spec.clone(), http)?)
        }
        FetcherSpec::Csv(spec) => Box::new(CsvFetcher::new(source_id, spec.clone(), http)),
        FetcherSpec::SdmxJson(spec) => Box::new(SdmxFetcher::new(source_id, spec.clone(), http)?),
        FetcherSpec::Fixture(spec) => {
            Box::new(FixtureFetcher::from_spec(source_id, spec, workspace_root))
        }
    };
    Ok(fetcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ihdp_storage::HttpClientConfig;

    #[tokio::test]
    async fn builds_fixture_fetcher_from_spec() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let spec = FetcherSpec::Fixture(FixtureSpec {
            dir: PathBuf::from("fixtures/demo-listings"),
        });
        let fetcher = build_fetcher("demo-listings", &spec, http, &root).unwrap();
        assert_eq!(fetcher.source_id(), "demo-listings");
        let batch = fetcher.fetch_batch(1).await.unwrap();
        assert!(!batch.records.is_empty());
    }

    #[test]
    fn invalid_json_pages_config_fails_at_build_time() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let spec = FetcherSpec::JsonPages(JsonPagesSpec {
            url_template: "https://listings.test/rent".into(),
            page_size: 20,
            embedded_script_selectors: vec![],
            records_pointer: "/listings".into(),
            item_pointer: None,
            fields: vec![FieldMapping::new("id", "/id", Transform::Raw)],
        });
        assert!(matches!(
            build_fetcher("broken", &spec, http, Path::new(".")),
            Err(FetchError::Config(_))
        ));
    }
}
