//! palace-markers binary
//!
//! Offline maintenance of the local marker store: import a downloaded export
//! file, list a floor's markers, or print per-floor counts.
//!
//! ## Configuration (env / file via `config` crate)
//!
//! | Key                         | Default                  | Description                   |
//! |-----------------------------|--------------------------|-------------------------------|
//! | `PAL_CONFIG`                | *(none)*                 | Config file (toml/json)       |
//! | `PAL_STORAGE_DIR`           | `palace-markers`         | Overrides `storage.dir`       |
//! | `PAL__MATCHING__TRAP`       | `0.5`                    | Trap match tolerance          |
//! | `PAL__MATCHING__HOARD`      | `0.5`                    | Hoard match tolerance         |
//! | `PAL__REMOTE__MODE`         | `online`                 | `online` / `offline`          |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use palace_markers::protocol::ExportFile;
use palace_markers::{
    JsonFileStore, MarkerStore, PalConfig, PositionMatcher, Reconciler, TerritoryCache,
    TerritoryId,
};
use std::path::PathBuf;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "palace-markers", about = "Palace marker store maintenance", version)]
struct Args {
    /// Configuration file
    #[arg(long, env = "PAL_CONFIG")]
    config: Option<PathBuf>,

    /// Marker store directory (overrides the config file)
    #[arg(long, env = "PAL_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a downloaded export file
    Import {
        /// Path to the export JSON
        file: PathBuf,
    },
    /// List every marker on one floor
    Show {
        /// Territory type
        #[arg(long)]
        territory: u16,
    },
    /// Print marker counts for every stored floor
    Stats,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("palace_markers=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = PalConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = args.storage_dir {
        config.storage.dir = dir;
    }

    log::info!(
        "Starting palace-markers (storage='{}', trap tolerance={}, hoard tolerance={})",
        config.storage.dir.display(),
        config.matching.trap,
        config.matching.hoard,
    );

    let store: Arc<dyn MarkerStore> = Arc::new(
        JsonFileStore::open(&config.storage.dir).context("Failed to open marker store")?,
    );
    let cache = Arc::new(TerritoryCache::new(
        store.clone(),
        PositionMatcher::new(config.matching),
    ));
    let reconciler = Reconciler::new(cache.clone());

    match args.command {
        Command::Import { file } => {
            let _span = tracing::info_span!("import", file = %file.display()).entered();
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let export = ExportFile::from_slice(&bytes)
                .with_context(|| format!("Invalid export file {}", file.display()))?;

            let report = reconciler.import_export(&export);
            let totals = report.totals();
            println!(
                "Imported export {} from {}: {} created, {} updated, {} unchanged, {} skipped",
                report.import_id,
                report.server,
                totals.created,
                totals.updated,
                totals.unchanged,
                report.skipped
            );
            for (territory, err) in &report.failed {
                eprintln!("  territory {}: {}", territory, err);
            }
            if totals.failed_writes > 0 {
                eprintln!("  {} markers could not be written yet", totals.failed_writes);
            }
        }
        Command::Show { territory } => {
            let _span = tracing::info_span!("show", territory).entered();
            let markers = cache
                .snapshot(TerritoryId(territory))
                .context("Failed to load territory")?;
            for m in markers {
                println!(
                    "{:>6} {:<13} {} seen={} remote={} imports={}",
                    m.local_id.to_string(),
                    m.kind.to_string(),
                    m.position,
                    m.seen,
                    m.remote_seen_on.len(),
                    m.imports.len()
                );
            }
        }
        Command::Stats => {
            let _span = tracing::info_span!("stats").entered();
            for territory in store.territories().context("Failed to list territories")? {
                cache.get_or_load(territory)?;
                if let Some(stats) = cache.stats(territory) {
                    println!("{}", serde_json::to_string(&stats)?);
                }
            }
        }
    }

    Ok(())
}
