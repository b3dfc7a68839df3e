//! Watermark-driven incremental loads for the IHDP bronze layer.

use std::sync::Arc;

use anyhow::{Context, Result};
use ihdp_storage::postgres::{connect, run_migrations};
use ihdp_storage::{
    DryRunSink, MemoryWatermarkStore, PgSink, PgWatermarkStore, Sink, WatermarkStore,
};
use sqlx::PgPool;
use tracing::{info, warn};

pub mod config;
pub mod coordinator;
pub mod registry;
pub mod report;
pub mod runner;

pub use config::EtlConfig;
pub use coordinator::{
    Coordinator, LoadError, LoadPolicy, ModeDecision, ModeLimits, RunReport, SourceJob,
};
pub use registry::{LimitOverrides, SourceConfig, SourceRegistry, SourceSelection};
pub use runner::{EtlRunner, RunRequest, RunSummary, SourceOutcome, SourceStatus};

pub const CRATE_NAME: &str = "ihdp-sync";

/// Postgres-backed stores for every source in the registry.
pub struct Warehouse {
    pub watermarks: Arc<PgWatermarkStore>,
    pub sink: Arc<PgSink>,
}

pub async fn load_registry(config: &EtlConfig) -> Result<SourceRegistry> {
    SourceRegistry::load(&config.sources_path()).await
}

fn registered_sink(pool: PgPool, registry: &SourceRegistry) -> Result<PgSink> {
    let mut sink = PgSink::new(pool);
    for source in &registry.sources {
        sink = sink
            .register(&source.source_id, &source.table)
            .with_context(|| format!("registering sink table for `{}`", source.source_id))?;
    }
    Ok(sink)
}

async fn open_pool(config: &EtlConfig) -> Result<PgPool> {
    connect(&config.database_url, &config.pool_config())
        .await
        .context("connecting to warehouse")
}

pub async fn connect_warehouse(config: &EtlConfig, registry: &SourceRegistry) -> Result<Warehouse> {
    let pool = open_pool(config).await?;
    let sink = registered_sink(pool.clone(), registry)?;
    Ok(Warehouse {
        watermarks: Arc::new(PgWatermarkStore::new(pool)),
        sink: Arc::new(sink),
    })
}

/// Applies the schema migrations and creates any missing bronze tables.
pub async fn migrate_warehouse(config: &EtlConfig, registry: &SourceRegistry) -> Result<()> {
    let pool = open_pool(config).await?;
    run_migrations(&pool).await.context("running migrations")?;
    registered_sink(pool, registry)?
        .ensure_tables()
        .await
        .context("creating bronze tables")?;
    info!(sources = registry.sources.len(), "warehouse migrated");
    Ok(())
}

/// Stores for `--dry-run`. Watermarks are copied and the sink reads through
/// to the warehouse when it is reachable, so mode decisions and duplicate
/// checks match a real run while every write stays in memory.
pub async fn dry_run_stores(
    config: &EtlConfig,
    registry: &SourceRegistry,
) -> (Arc<MemoryWatermarkStore>, Arc<DryRunSink>) {
    let watermarks = Arc::new(MemoryWatermarkStore::new());
    let warehouse = match connect_warehouse(config, registry).await {
        Ok(warehouse) => warehouse,
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                "warehouse unreachable; dry run starts from empty stores"
            );
            return (watermarks, Arc::new(DryRunSink::new(None)));
        }
    };

    match warehouse.watermarks.list().await {
        Ok(existing) => {
            for watermark in &existing {
                if let Err(err) = watermarks.upsert(watermark).await {
                    warn!(error = %err, "copying watermark for dry run");
                }
            }
            info!(watermarks = existing.len(), "dry run seeded from warehouse");
        }
        Err(err) => warn!(error = %err, "dry run starts without watermarks"),
    }
    let base: Arc<dyn Sink> = warehouse.sink;
    (watermarks, Arc::new(DryRunSink::new(Some(base))))
}
