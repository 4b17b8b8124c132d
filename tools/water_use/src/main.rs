/// Water use tool: trim basal area below a threshold, derive daily water use
/// for each sap flux scenario and sum it over sub-watersheds and lake basins.
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sapflux_core::config::{load_json, Validate, WaterUseConfig};
use sapflux_core::pipeline::run_water_use;
use sapflux_core::{ExecutionContext, GeoTiffStore};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "water_use",
    about = "Estimate black ash water use from a basal area map and sum it by watershed"
)]
struct Args {
    /// Directory holding the basal area GeoTIFF
    #[arg(long, default_value = "Data_Output")]
    input_dir: PathBuf,

    /// Directory holding rasterized zone layers (defaults to --input-dir)
    #[arg(long)]
    zones_dir: Option<PathBuf>,

    /// Output directory; zonal results go to <output>/Zonal
    #[arg(short, long, default_value = "Data_Output")]
    output: PathBuf,

    /// Basal area dataset name (without .tif)
    #[arg(long, default_value = "Fraxinus_nigra_Basal_Area_sqft_acre_Great_Lakes")]
    basal_area: String,

    /// JSON config; unspecified keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the minimum basal area (ft²/ac)
    #[arg(long)]
    minimum_ba: Option<f64>,

    /// Override the per-cell area (acres)
    #[arg(long)]
    cell_area_acres: Option<f64>,

    /// Write the run summary as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut config = match &args.config {
        Some(path) => load_json::<WaterUseConfig>(path)
            .with_context(|| format!("Cannot load config {}", path.display()))?,
        None => WaterUseConfig::default(),
    };
    if let Some(minimum) = args.minimum_ba {
        config.minimum_basal_area = minimum;
    }
    if args.cell_area_acres.is_some() {
        config.cell_area_acres = args.cell_area_acres;
    }
    config.validate().context("Invalid water use configuration")?;

    let mut ctx = ExecutionContext::on_disk(&args.input_dir, &args.output);
    if let Some(dir) = &args.zones_dir {
        ctx = ctx.with_zones(std::sync::Arc::new(GeoTiffStore::new(dir)));
    }

    let report = run_water_use(&ctx, &config, &args.basal_area)
        .with_context(|| format!("Water use run failed for {}", args.basal_area))?;

    for (scenario, total) in &report.totals_cubic_feet {
        info!(
            scenario = %scenario,
            cubic_feet_per_day = total,
            gallons_per_day = total * config.gallons_per_cubic_foot,
            "basin total"
        );
    }
    info!(rasters = report.rasters.len(), zonal = report.zonal.len(), "done");

    if let Some(path) = &args.report {
        fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Cannot write {}", path.display()))?;
    }
    Ok(())
}
