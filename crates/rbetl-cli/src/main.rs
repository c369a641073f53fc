use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rbetl_core::{RunSummary, StoreStatus};
use rbetl_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rbetl")]
#[command(about = "Restaurant Board reservation ETL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extraction + merge cycle over all active stores
    Sync,
    /// Stage and merge an operator-supplied normalized CSV
    Backfill {
        /// Path to the normalized CSV
        file: PathBuf,
    },
    /// Serve the HTTP trigger/query surface
    Serve {
        #[arg(long, default_value = "8000")]
        port: u16,
    },
    /// Expire staged rows and landing objects past their TTL
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
            if summary.partial_failure() {
                // Distinct exit status so the scheduler can alert and
                // re-trigger under a new run id.
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Backfill { file } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let backfill = pipeline.run_manual_backfill(&file).await?;
            println!(
                "backfill complete: run_id={} staged={} inserted={} updated={} unchanged={}",
                backfill.run_id,
                backfill.rows_staged,
                backfill.merge.inserted,
                backfill.merge.updated,
                backfill.merge.unchanged
            );
        }
        Commands::Serve { port } => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            rbetl_web::serve(rbetl_web::AppState::new(pipeline), port).await?;
        }
        Commands::Cleanup => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let cleanup = pipeline.run_cleanup().await?;
            println!(
                "cleanup complete: staging_rows={} landing_objects={}",
                cleanup.staging_deleted, cleanup.landing_deleted
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} finished: stores={} succeeded={} failed={} staged={}",
        summary.run_id,
        summary.stores_attempted(),
        summary.stores_succeeded(),
        summary.stores_failed(),
        summary.records_staged()
    );
    for store in &summary.stores {
        match &store.status {
            StoreStatus::Succeeded => println!(
                "  {} ok: normalized={} skipped={} staged={}",
                store.store_id, store.records_normalized, store.rows_skipped, store.records_staged
            ),
            StoreStatus::Failed { reason } => {
                println!("  {} FAILED: {}", store.store_id, reason);
            }
        }
    }
    match &summary.merge {
        Some(merge) => println!(
            "merge: inserted={} updated={} unchanged={} total={}",
            merge.inserted,
            merge.updated,
            merge.unchanged,
            merge.total()
        ),
        None => println!("merge: skipped"),
    }
}
