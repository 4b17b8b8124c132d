/// Basal area tool: convert the Canadian biomass map to basal area, mosaic it
/// with the US basal area map and clip the result to the basin.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sapflux_core::config::{load_json, BasalAreaConfig, Validate};
use sapflux_core::pipeline::run_basal_area;
use sapflux_core::{ExecutionContext, GeoTiffStore, MosaicMethod};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "basal_area",
    about = "Unify US basal area and Canadian biomass kNN maps into one basal area map"
)]
struct Args {
    /// Directory holding both source GeoTIFFs
    #[arg(long, default_value = "Data_Raw")]
    input_dir: PathBuf,

    /// Directory holding the basin zone layer (defaults to --input-dir)
    #[arg(long)]
    zones_dir: Option<PathBuf>,

    /// Output directory (created if absent)
    #[arg(short, long, default_value = "Data_Output")]
    output: PathBuf,

    /// JSON config; unspecified keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override m in basal_area = m * biomass
    #[arg(long)]
    biomass_factor: Option<f64>,

    /// Override how overlapping cells combine (mean, minimum, maximum, sum, first, last)
    #[arg(long)]
    mosaic_method: Option<String>,

    /// Skip clipping to the basin mask
    #[arg(long)]
    no_mask: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_method(name: &str) -> Result<MosaicMethod> {
    serde_json::from_value(serde_json::Value::String(name.to_lowercase()))
        .with_context(|| format!("Unknown mosaic method {name}"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut config = match &args.config {
        Some(path) => load_json::<BasalAreaConfig>(path)
            .with_context(|| format!("Cannot load config {}", path.display()))?,
        None => BasalAreaConfig::default(),
    };
    if let Some(m) = args.biomass_factor {
        config.biomass_to_basal_area = m;
    }
    if let Some(method) = &args.mosaic_method {
        config.mosaic_method = parse_method(method)?;
    }
    if args.no_mask {
        config.mask_dataset = None;
    }
    config.validate().context("Invalid basal area configuration")?;

    let mut ctx = ExecutionContext::on_disk(&args.input_dir, &args.output);
    if let Some(dir) = &args.zones_dir {
        ctx = ctx.with_zones(std::sync::Arc::new(GeoTiffStore::new(dir)));
    }

    let report = run_basal_area(&ctx, &config).context("Basal area run failed")?;
    info!(
        factor = report.adjustment.factor,
        outputs = ?report.outputs,
        "basal area map written"
    );
    Ok(())
}
