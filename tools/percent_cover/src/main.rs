/// Percent cover tool: sum every species basal area layer in batches and
/// express one species as a percentage of the total.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sapflux_core::config::{load_json, PercentCoverConfig, Validate};
use sapflux_core::pipeline::run_percent_cover;
use sapflux_core::ExecutionContext;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "percent_cover",
    about = "Chunked total of species basal area layers and the target species' percent cover"
)]
struct Args {
    /// Directory of per-species GeoTIFFs
    #[arg(long, default_value = "US_BasalArea_kNN_Maps")]
    input_dir: PathBuf,

    /// Output directory; chunk results go to <output>/Chunk_Maps
    #[arg(short, long, default_value = "Ash_Cover")]
    output: PathBuf,

    /// JSON config; unspecified keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Most layers combined in one operation
    #[arg(long)]
    batch_size: Option<usize>,

    /// Target species dataset
    #[arg(long)]
    target: Option<String>,

    /// Keep batch results on disk while reducing
    #[arg(long)]
    persist_chunks: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut config = match &args.config {
        Some(path) => load_json::<PercentCoverConfig>(path)
            .with_context(|| format!("Cannot load config {}", path.display()))?,
        None => PercentCoverConfig::default(),
    };
    if let Some(n) = args.batch_size {
        config.chunk_batch_size = n;
    }
    if let Some(target) = &args.target {
        config.target_dataset = target.clone();
    }
    config.persist_chunks |= args.persist_chunks;
    config.validate().context("Invalid percent cover configuration")?;

    let ctx = ExecutionContext::on_disk(&args.input_dir, &args.output);
    let report = run_percent_cover(&ctx, &config)
        .with_context(|| format!("Percent cover run failed in {}", args.input_dir.display()))?;
    info!(
        layers = report.layers,
        batches = report.batches,
        output = %report.percent_output,
        "percent cover written"
    );
    Ok(())
}
