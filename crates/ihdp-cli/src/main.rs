use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ihdp_storage::{Sink, WatermarkStore};
use ihdp_sync::{
    connect_warehouse, dry_run_stores, load_registry, migrate_warehouse, report, EtlConfig,
    EtlRunner, RunRequest, SourceSelection, SourceStatus,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ihdp")]
#[command(about = "Irish Housing Data Platform incremental loader")]
struct Cli {
    /// Used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load the selected sources into the bronze layer.
    Run {
        /// Source id to run; repeatable. Disabled sources run when named.
        #[arg(long = "source")]
        sources: Vec<String>,
        #[arg(long, conflicts_with = "sources")]
        group: Option<String>,
        /// Ignore stored watermarks and reload every page.
        #[arg(long)]
        force_full: bool,
        /// Fetch and filter but write nothing to the warehouse.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the stored watermark of every source.
    Status,
    /// Apply migrations and create missing bronze tables.
    Migrate,
    /// List the configured sources.
    Sources,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Cancels `token` on SIGINT or SIGTERM. Runs stop between pages.
fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                warn!(error = %err, "could not listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "could not listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c; stopping after the current page"),
            _ = terminate => info!("received SIGTERM; stopping after the current page"),
        }
        token.cancel();
    });
}

async fn run(
    config: EtlConfig,
    request: RunRequest,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let registry = load_registry(&config).await?;
    let (watermarks, sink): (Arc<dyn WatermarkStore>, Arc<dyn Sink>) = if request.dry_run {
        let (watermarks, sink) = dry_run_stores(&config, &registry).await;
        (watermarks as Arc<dyn WatermarkStore>, sink as Arc<dyn Sink>)
    } else {
        let warehouse = connect_warehouse(&config, &registry).await?;
        (
            warehouse.watermarks as Arc<dyn WatermarkStore>,
            warehouse.sink as Arc<dyn Sink>,
        )
    };

    let runner = EtlRunner::new(config, registry, watermarks, sink)?;
    let summary = runner.run_once(&request, &cancel).await?;

    for outcome in &summary.sources {
        match (&outcome.report, outcome.status) {
            (Some(r), status) => println!(
                "{:<24} {:<9} mode={} pages={} inserted={} stale={} duplicates={} watermark={}",
                outcome.source_id,
                format!("{status:?}").to_lowercase(),
                r.mode,
                r.pages_fetched,
                r.inserted,
                r.stale,
                r.duplicates,
                r.watermark_after
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            (None, _) => println!(
                "{:<24} failed    {}",
                outcome.source_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!(
        "run complete: run_id={} inserted={} reports={}",
        summary.run_id,
        summary.total_inserted(),
        summary.reports_dir.as_deref().unwrap_or("-")
    );

    if cancel.is_cancelled()
        || summary
            .sources
            .iter()
            .any(|s| s.status == SourceStatus::Cancelled)
    {
        return Ok(ExitCode::from(130));
    }
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn status(config: EtlConfig) -> Result<ExitCode> {
    let registry = load_registry(&config).await?;
    let warehouse = connect_warehouse(&config, &registry).await?;
    let watermarks = warehouse
        .watermarks
        .list()
        .await
        .context("listing watermarks")?;
    println!("{}", report::render_status(&watermarks));
    Ok(ExitCode::SUCCESS)
}

async fn sources(config: EtlConfig) -> Result<ExitCode> {
    let registry = load_registry(&config).await?;
    for source in &registry.sources {
        println!(
            "{:<24} {:<10} {:<8} {:<32} {}",
            source.source_id,
            source.fetcher.kind(),
            if source.enabled { "enabled" } else { "disabled" },
            source.table,
            source.display_name
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = EtlConfig::from_env();
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run {
        sources: Vec::new(),
        group: None,
        force_full: false,
        dry_run: false,
    }) {
        Commands::Run {
            sources,
            group,
            force_full,
            dry_run,
        } => {
            let cancel = CancellationToken::new();
            cancel_on_shutdown(cancel.clone());
            let request = RunRequest {
                selection: SourceSelection {
                    source_ids: sources,
                    group,
                },
                force_full,
                dry_run,
            };
            run(config, request, cancel).await
        }
        Commands::Status => status(config).await,
        Commands::Migrate => {
            let registry = load_registry(&config).await?;
            migrate_warehouse(&config, &registry).await?;
            println!("migrations applied; bronze tables ready");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sources => sources(config).await,
    }
}
