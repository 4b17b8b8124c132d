//! Unify a basal area dataset and a biomass dataset into one basal area map.
//!
//! The biomass map is converted with `m`, corrected by the adjustment factor
//! between the two datasets, then mosaicked with the reference onto the
//! reference grid. An optional zone mask clips the result to the basin.
use serde::Serialize;
use tracing::info;

use crate::algebra;
use crate::config::BasalAreaConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::mosaic::mosaic;
use crate::raster::Raster;
use crate::stats::AdjustmentFactor;

#[derive(Debug, Clone)]
pub struct UnifiedBasalArea {
    pub adjustment: AdjustmentFactor,
    /// Source in basal area units, before mosaicking.
    pub converted: Raster,
    pub full_range: Raster,
    pub clipped: Option<Raster>,
}

/// Convert `source` to `reference`'s units and combine the two.
///
/// `mask` marks the cells kept in the clipped output; anything NoData in the
/// mask (or outside it) is dropped.
pub fn unify_basal_area(
    reference: &Raster,
    source: &Raster,
    mask: Option<&Raster>,
    config: &BasalAreaConfig,
) -> Result<UnifiedBasalArea> {
    let m = config.biomass_to_basal_area;
    let source = if config.source_zero_is_nodata {
        algebra::set_null(source, |v| v == 0.0)
    } else {
        source.clone()
    };

    let adjustment = AdjustmentFactor::from_rasters(reference, &source, m)?;
    info!(
        mean_adjust = adjustment.mean_adjust,
        max_adjust = adjustment.max_adjust,
        factor = adjustment.factor,
        "adjustment factor"
    );
    let converted = adjustment.apply(&source, m);
    let full_range = mosaic(&[&converted, reference], reference, config.mosaic_method)?;
    let clipped = mask
        .map(|mask| algebra::extract_by_mask(&full_range, mask))
        .transpose()?;

    Ok(UnifiedBasalArea { adjustment, converted, full_range, clipped })
}

#[derive(Debug, Clone, Serialize)]
pub struct BasalAreaReport {
    pub adjustment: AdjustmentFactor,
    pub outputs: Vec<String>,
}

/// Read both datasets (and the mask zones), write the full-range map and,
/// when a mask is configured, the clipped map.
pub fn run_basal_area(ctx: &ExecutionContext, config: &BasalAreaConfig) -> Result<BasalAreaReport> {
    let reference = ctx.inputs.read_raster(&config.reference_dataset)?;
    let source = ctx.inputs.read_raster(&config.source_dataset)?;
    let mask = config
        .mask_dataset
        .as_deref()
        .map(|name| ctx.zones.read_zones(name, &config.mask_field))
        .transpose()?
        .map(|zones| zones.to_raster());

    let unified = unify_basal_area(&reference, &source, mask.as_ref(), config)?;

    let mut outputs = Vec::new();
    ctx.outputs.write_raster(&config.full_range_output, &unified.full_range)?;
    outputs.push(config.full_range_output.clone());
    if let Some(clipped) = &unified.clipped {
        ctx.outputs.write_raster(&config.clipped_output, clipped)?;
        outputs.push(config.clipped_output.clone());
    }
    Ok(BasalAreaReport { adjustment: unified.adjustment, outputs })
}
