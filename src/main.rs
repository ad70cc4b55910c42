use clap::Parser;
use geomerge::config::{ParallelismPolicy, PipelineConfig};
use geomerge::pipeline::{Pipeline, run_from_file};
use geomerge::store::local::LocalStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geomerge")]
#[command(about = "Consolidate cadastral shapefile downloads into a single feature store")]
#[command(version)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, default_value = "config.json", env = "GEOMERGE_CONFIG")]
    config: PathBuf,

    /// Skip archive extraction and organization; plan from the category directories
    #[arg(long)]
    skip_ingest: bool,

    /// Concurrent workers (overrides the configured parallelism policy)
    #[arg(long)]
    workers: Option<usize>,

    /// Work units per category (overrides the configured parallelism policy)
    #[arg(long)]
    chunks: Option<usize>,

    /// Also consolidate the standalone .dbf tables into the final container
    #[arg(long)]
    tables: bool,
}

fn apply_overrides(config: &mut PipelineConfig, cli: &Cli) {
    if cli.tables {
        config.consolidate_tables = true;
    }
    if cli.workers.is_none() && cli.chunks.is_none() {
        return;
    }
    let resolved = config.parallelism.resolve();
    config.parallelism = ParallelismPolicy::Fixed {
        workers: cli.workers.unwrap_or(resolved.workers),
        chunks_per_category: cli.chunks.unwrap_or(resolved.chunks_per_category),
    };
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = run_from_file(&cli.config, Arc::new(LocalStore::new()), |mut config, store| {
        apply_overrides(&mut config, &cli);
        Pipeline::new(config, store).skip_ingest(cli.skip_ingest)
    });
    match result {
        Ok(summary) => {
            let failed = summary.pool.failed().count();
            info!(
                files = summary.files,
                units = summary.pool.outcomes.len(),
                failed_units = failed,
                record_sets = summary.merge.written(),
                merge_failures = summary.merge.failures.len(),
                "pipeline completed"
            );
            if let Some(tables) = &summary.tables {
                info!(
                    tables = tables.merged.len(),
                    rows = tables.rows,
                    failures = tables.failures.len(),
                    "standalone tables consolidated"
                );
            }
            if !summary.cleanup.is_clean() {
                warn!("temporary files remain; remove them once the store releases its locks");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(config = %cli.config.display(), error = %e, "pipeline failed");
            ExitCode::FAILURE
        }
    }
}
