use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use brueter_geocode_lib::{run_guard, AppConfig, AppState, ResolveStatus};

/// Geocode building-nesting-bird observations and keep the store safe
///
/// Typical run:
///   brueter-geocode guard
///   brueter-geocode export-missing
///   brueter-geocode prepare
///   brueter-geocode geocode-missing
///   brueter-geocode apply-results
#[derive(Parser, Debug)]
#[command(name = "brueter-geocode")]
#[command(version, about, long_about = None)]
struct Args {
    /// Live store path (overrides BRUETER_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Normalize queued streets and flag records without a house number
    Prepare,
    /// Rewrite the missing-address queue from the store
    ExportMissing,
    /// Geocode every queued row into the results file
    GeocodeMissing,
    /// Upsert the results file into the store and shrink the queue
    ApplyResults,
    /// Geocode records flagged as new directly into the store
    GeocodeNew {
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Geocode a single record by identifier
    GeocodeOne { web_id: i64 },
    /// Restore the backup when the live store has fewer records
    Guard,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::from_env();
    if let Some(db) = args.db {
        config.set_db_path(db);
    }

    match args.command {
        Command::Guard => {
            let report = run_guard(&config).context("backup guard failed")?;
            info!(
                decision = ?report.decision,
                live = ?report.live_count,
                backup = ?report.backup_count,
                restored = ?report.restored_count,
                snapshot_created = report.snapshot_created,
                "guard finished"
            );
        }
        Command::Prepare => match open(config)?.prepare_missing()? {
            Some(summary) => info!(
                cleaned = summary.cleaned,
                no_geocode = summary.marked_no_geocode,
                "prepare finished"
            ),
            None => info!("queue file not found; nothing to prepare"),
        },
        Command::ExportMissing => {
            let rows = open(config)?.export_missing()?;
            info!(rows, "missing-address queue exported");
        }
        Command::GeocodeMissing => {
            let summary = open(config)?
                .geocode_missing()
                .await
                .context("geocoding the missing queue failed")?;
            info!(
                processed = summary.processed,
                per_provider = ?summary.resolved_per_provider,
                unresolved = summary.unresolved,
                "geocode-missing finished"
            );
        }
        Command::ApplyResults => {
            let summary = open(config)?
                .apply_results()
                .context("applying geocode results failed")?;
            info!(
                applied = summary.applied,
                per_provider = ?summary.applied_per_provider,
                failed = summary.failed,
                remaining = summary.remaining,
                "apply-results finished"
            );
        }
        Command::GeocodeNew { limit } => {
            let summary = open(config)?.geocode_new(limit).await?;
            info!(
                processed = summary.processed,
                resolved = summary.resolved(),
                skipped = summary.skipped,
                failed = summary.failed,
                "geocode-new finished"
            );
        }
        Command::GeocodeOne { web_id } => match open(config)?.geocode_one(web_id).await? {
            Some(resolution) if resolution.status == ResolveStatus::Ok => info!(
                web_id,
                provider = ?resolution.provider(),
                address = %resolution.attempted_address,
                "record geocoded"
            ),
            Some(resolution) => info!(
                web_id,
                status = resolution.status.as_str(),
                "no geocode result"
            ),
            None => info!(web_id, "no record with this identifier"),
        },
    }
    Ok(())
}

fn open(config: AppConfig) -> Result<AppState> {
    let path = config.db_path.clone();
    AppState::initialize(config)
        .with_context(|| format!("failed to open live store {}", path.display()))
}
