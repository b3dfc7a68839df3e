use std::path::Path;
use std::sync::Arc;

use ihdp_core::{LoadMode, RecencyKey, WatermarkStatus};
use ihdp_storage::{MemorySink, MemoryWatermarkStore, WatermarkStore};
use ihdp_sync::{
    Coordinator, EtlConfig, EtlRunner, LoadPolicy, RunRequest, SourceRegistry, SourceSelection,
    SourceStatus,
};
use tokio_util::sync::CancellationToken;

const SOURCES: &str = r#"
sources:
  - source_id: rentals
    display_name: Demo rentals
    groups: [rentals]
    table: bronze.demo_rentals
    recency_field: published_at
    natural_key: [listing_id]
    fetcher:
      kind: fixture
      dir: pages/rentals
  - source_id: broken
    display_name: Misconfigured listings
    groups: [rentals]
    table: bronze.broken
    recency_field: publish_date
    natural_key: [property_id]
    fetcher:
      kind: json_pages
      url_template: "https://listings.test/rent"
      records_pointer: /listings
      fields:
        - { name: property_id, pointer: /id }
"#;

fn write_page(root: &Path, page: u32, body: &str) {
    let dir = root.join("pages/rentals");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("page-{page}.json")), body).unwrap();
}

struct Harness {
    _workspace: tempfile::TempDir,
    root: std::path::PathBuf,
    watermarks: Arc<MemoryWatermarkStore>,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new() -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let root = workspace.path().to_path_buf();
        write_page(
            &root,
            1,
            r#"{"records": [
                {"listing_id": "A", "published_at": 300, "price": 2100},
                {"listing_id": "B", "published_at": 200, "price": 1850}
            ]}"#,
        );
        write_page(
            &root,
            2,
            r#"{"records": [{"listing_id": "C", "published_at": 100, "price": 1600}], "has_more": false}"#,
        );
        Self {
            _workspace: workspace,
            root,
            watermarks: Arc::new(MemoryWatermarkStore::new()),
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn runner(&self) -> EtlRunner {
        let root = self.root.display().to_string();
        let config = EtlConfig::from_lookup(|key| match key {
            "IHDP_WORKSPACE_ROOT" => Some(root.clone()),
            "IHDP_SCRAPE_DELAY_SECS" => Some("0".to_string()),
            _ => None,
        });
        let registry = SourceRegistry::from_yaml_str(SOURCES).unwrap();
        let coordinator = Coordinator::new(
            LoadPolicy::default().without_delays(),
            self.watermarks.clone(),
            self.sink.clone(),
        );
        EtlRunner::new(config, registry, self.watermarks.clone(), self.sink.clone())
            .unwrap()
            .with_coordinator(coordinator)
    }
}

#[tokio::test]
async fn first_run_loads_everything_and_reports_the_failed_source() {
    let harness = Harness::new();
    let summary = harness
        .runner()
        .run_once(&RunRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.sources.len(), 2);
    let broken = &summary.sources[0];
    assert_eq!(broken.source_id, "broken");
    assert_eq!(broken.status, SourceStatus::Failed);
    assert!(broken.error.as_deref().unwrap().contains("json_pages"));

    let rentals = &summary.sources[1];
    assert_eq!(rentals.status, SourceStatus::Completed);
    let report = rentals.report.as_ref().unwrap();
    assert_eq!(report.mode, LoadMode::Full);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.pages_fetched, 2);

    let watermark = harness.watermarks.get("rentals").await.unwrap().unwrap();
    assert_eq!(watermark.max_recency_key, Some(RecencyKey(300)));
    assert_eq!(watermark.record_count, 3);
    assert_eq!(watermark.status, WatermarkStatus::Completed);
    assert!(harness.watermarks.get("broken").await.unwrap().is_none());

    let reports_dir = harness.root.join("reports").join(summary.run_id.to_string());
    assert_eq!(summary.reports_dir.as_deref(), Some(reports_dir.to_str().unwrap()));
    assert!(reports_dir.join("summary.json").exists());
    assert!(reports_dir.join("summary.md").exists());
}

#[tokio::test]
async fn second_run_is_incremental_and_only_adds_new_listings() {
    let harness = Harness::new();
    let only_rentals = RunRequest {
        selection: SourceSelection {
            source_ids: vec!["rentals".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let runner = harness.runner();
    let first = runner
        .run_once(&only_rentals, &CancellationToken::new())
        .await
        .unwrap();
    assert!(first.is_success());

    write_page(
        &harness.root,
        1,
        r#"{"records": [
            {"listing_id": "D", "published_at": 400, "price": 2300},
            {"listing_id": "A", "published_at": 300, "price": 2100},
            {"listing_id": "B", "published_at": 200, "price": 1850}
        ]}"#,
    );
    let second = runner
        .run_once(&only_rentals, &CancellationToken::new())
        .await
        .unwrap();
    let report = second.sources[0].report.as_ref().unwrap();
    assert_eq!(report.mode, LoadMode::Incremental);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.stale, 3);
    assert_eq!(report.watermark_before, Some(RecencyKey(300)));
    assert_eq!(report.watermark_after, Some(RecencyKey(400)));

    let watermark = harness.watermarks.get("rentals").await.unwrap().unwrap();
    assert_eq!(watermark.record_count, 4);
    assert_eq!(harness.sink.records("rentals").await.len(), 4);
}

#[tokio::test]
async fn cancelled_run_leaves_no_watermark_behind() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = harness
        .runner()
        .run_once(
            &RunRequest {
                selection: SourceSelection {
                    group: Some("rentals".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();

    let rentals = summary
        .sources
        .iter()
        .find(|s| s.source_id == "rentals")
        .unwrap();
    assert_eq!(rentals.status, SourceStatus::Cancelled);
    assert_eq!(harness.watermarks.upsert_count(), 0);
    assert!(harness.sink.records("rentals").await.is_empty());
}
