//! Run configuration for the three pipelines.
//!
//! Every struct derives serde with `#[serde(default)]`, so a JSON file only
//! needs the keys it overrides. Defaults are the calibrated black ash values
//! for the 250 m Great Lakes grid.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::chunked::DEFAULT_BATCH_SIZE;
use crate::error::{Result, SapfluxError};
use crate::mosaic::MosaicMethod;

/// Square metres to acres.
pub const ACRES_PER_SQUARE_METRE: f64 = 0.000247105;
/// US gallons in one cubic foot.
pub const GALLONS_PER_CUBIC_FOOT: f64 = 7.48052;
/// Biomass (kg/ha) to basal area (ft²/ac) for black ash.
pub const BIOMASS_TO_BASAL_AREA: f64 = 10.31443;

/// Load a config from JSON and validate it.
pub fn load_json<T: DeserializeOwned + Validate>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    let config: T = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
}

/// Checks run before any raster is touched.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn require(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(SapfluxError::Configuration(msg()))
    }
}

fn require_name(what: &str, name: &str) -> Result<()> {
    require(
        !name.is_empty() && !name.contains(['/', '\\']),
        || format!("{what} must be a plain non-empty name, got {name:?}"),
    )
}

/// Linear basal area -> sapwood area fit: `SA = intercept + slope * BA`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SapwoodRegression {
    pub intercept: f64,
    pub slope: f64,
}

impl Default for SapwoodRegression {
    fn default() -> Self {
        // Fitted on the nine inventory sites (ft²/ac).
        Self { intercept: 1.2500370, slope: 0.1648406 }
    }
}

/// Units a zonal output is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputUnit {
    CubicFeet,
    Gallons,
}

impl OutputUnit {
    pub fn label(self) -> &'static str {
        match self {
            OutputUnit::CubicFeet => "cubicft",
            OutputUnit::Gallons => "gallons",
        }
    }
}

/// One zone granularity to aggregate water use over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneLayerSpec {
    /// Dataset name of the rasterized zone layer.
    pub dataset: String,
    /// Zone identifier attribute, e.g. "Watershed" or "LAKEBASIN".
    pub field: String,
    /// Name used in output files, e.g. "Subwatershed".
    pub label: String,
    pub units: Vec<OutputUnit>,
    /// Truncate the zonal raster to integers and attach an attribute table.
    #[serde(default)]
    pub integer_output: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterUseConfig {
    /// Basal area (ft²/ac) at or below which a cell counts as no ash.
    pub minimum_basal_area: f64,
    pub regression: SapwoodRegression,
    /// Scenario name -> sap flux (ft³ ft⁻² d⁻¹).
    pub flux_scenarios: BTreeMap<String, f64>,
    /// Grid resolution in metres.
    pub cell_size_m: f64,
    /// Overrides the cell area derived from `cell_size_m`.
    pub cell_area_acres: Option<f64>,
    pub gallons_per_cubic_foot: f64,
    pub species_prefix: String,
    pub region: String,
    pub zone_layers: Vec<ZoneLayerSpec>,
}

impl Default for WaterUseConfig {
    fn default() -> Self {
        Self {
            minimum_basal_area: 20.0,
            regression: SapwoodRegression::default(),
            flux_scenarios: BTreeMap::from([
                ("Median".to_string(), 8.3619),
                ("Mean".to_string(), 8.7361),
                ("Maximum".to_string(), 20.3371),
            ]),
            cell_size_m: 250.0,
            cell_area_acres: None,
            gallons_per_cubic_foot: GALLONS_PER_CUBIC_FOOT,
            species_prefix: "Fraxinus_nigra".to_string(),
            region: "Great_Lakes".to_string(),
            zone_layers: vec![
                ZoneLayerSpec {
                    dataset: "Great_Lakes_Subwatersheds".to_string(),
                    field: "Watershed".to_string(),
                    label: "Subwatershed".to_string(),
                    units: vec![OutputUnit::CubicFeet, OutputUnit::Gallons],
                    integer_output: false,
                },
                ZoneLayerSpec {
                    dataset: "Great_Lakes_Watersheds".to_string(),
                    field: "LAKEBASIN".to_string(),
                    label: "Lake_Basin".to_string(),
                    units: vec![OutputUnit::CubicFeet],
                    integer_output: true,
                },
            ],
        }
    }
}

impl WaterUseConfig {
    /// Acres covered by one cell.
    pub fn cell_area_acres(&self) -> f64 {
        self.cell_area_acres
            .unwrap_or(self.cell_size_m * self.cell_size_m * ACRES_PER_SQUARE_METRE)
    }
}

impl Validate for WaterUseConfig {
    fn validate(&self) -> Result<()> {
        require(self.minimum_basal_area.is_finite() && self.minimum_basal_area >= 0.0, || {
            format!("minimum_basal_area must be a non-negative number, got {}", self.minimum_basal_area)
        })?;
        require(
            self.regression.intercept.is_finite() && self.regression.slope.is_finite(),
            || "regression coefficients must be finite".to_string(),
        )?;
        require(!self.flux_scenarios.is_empty(), || "at least one flux scenario is required".to_string())?;
        for (name, rate) in &self.flux_scenarios {
            require_name("flux scenario name", name)?;
            require(rate.is_finite() && *rate > 0.0, || format!("flux scenario {name} must be positive, got {rate}"))?;
        }
        require(self.cell_size_m.is_finite() && self.cell_size_m > 0.0, || {
            format!("cell_size_m must be positive, got {}", self.cell_size_m)
        })?;
        let area = self.cell_area_acres();
        require(area.is_finite() && area > 0.0, || format!("cell area must be positive, got {area}"))?;
        require(
            self.gallons_per_cubic_foot.is_finite() && self.gallons_per_cubic_foot > 0.0,
            || format!("gallons_per_cubic_foot must be positive, got {}", self.gallons_per_cubic_foot),
        )?;
        require_name("species_prefix", &self.species_prefix)?;
        require_name("region", &self.region)?;
        for spec in &self.zone_layers {
            require_name("zone layer dataset", &spec.dataset)?;
            require_name("zone layer label", &spec.label)?;
            require(!spec.field.is_empty(), || format!("zone layer {} has no field", spec.dataset))?;
            require(!spec.units.is_empty(), || format!("zone layer {} has no output units", spec.dataset))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasalAreaConfig {
    /// Dataset already in basal area units (US kNN map).
    pub reference_dataset: String,
    /// Biomass dataset to convert (Canadian kNN map).
    pub source_dataset: String,
    /// Optional basin zone layer the unified map is clipped to.
    pub mask_dataset: Option<String>,
    /// Zone field of the mask layer.
    pub mask_field: String,
    /// `m` in `basal_area = m * biomass`.
    pub biomass_to_basal_area: f64,
    /// Treat zero biomass as NoData before computing statistics.
    pub source_zero_is_nodata: bool,
    pub mosaic_method: MosaicMethod,
    pub full_range_output: String,
    pub clipped_output: String,
}

impl Default for BasalAreaConfig {
    fn default() -> Self {
        Self {
            reference_dataset: "s543".to_string(),
            source_dataset: "NFI_MODIS250m_kNN_Species_Frax_Nig_reproj".to_string(),
            mask_dataset: Some("Great_Lakes_Watersheds".to_string()),
            mask_field: "LAKEBASIN".to_string(),
            biomass_to_basal_area: BIOMASS_TO_BASAL_AREA,
            source_zero_is_nodata: true,
            mosaic_method: MosaicMethod::Mean,
            full_range_output: "Fraxinus_nigra_Basal_Area_sqft_acre_Full_Range".to_string(),
            clipped_output: "Fraxinus_nigra_Basal_Area_sqft_acre_Great_Lakes".to_string(),
        }
    }
}

impl Validate for BasalAreaConfig {
    fn validate(&self) -> Result<()> {
        require_name("reference_dataset", &self.reference_dataset)?;
        require_name("source_dataset", &self.source_dataset)?;
        if let Some(mask) = &self.mask_dataset {
            require_name("mask_dataset", mask)?;
            require(!self.mask_field.is_empty(), || "mask_field must not be empty".to_string())?;
        }
        require(
            self.biomass_to_basal_area.is_finite() && self.biomass_to_basal_area > 0.0,
            || format!("biomass_to_basal_area must be positive, got {}", self.biomass_to_basal_area),
        )?;
        require_name("full_range_output", &self.full_range_output)?;
        require_name("clipped_output", &self.clipped_output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentCoverConfig {
    /// Most layers combined in one cell-statistics operation.
    pub chunk_batch_size: usize,
    /// Species whose share of total cover is reported.
    pub target_dataset: String,
    /// Multiplier applied to the target / total ratio.
    pub percent_scale: f64,
    /// Save each batch result to the scratch store while reducing.
    pub persist_chunks: bool,
    pub total_output: String,
    pub percent_output: String,
}

impl Default for PercentCoverConfig {
    fn default() -> Self {
        Self {
            chunk_batch_size: DEFAULT_BATCH_SIZE,
            target_dataset: "s543".to_string(),
            percent_scale: 100.0,
            persist_chunks: false,
            total_output: "All_Species".to_string(),
            percent_output: "Ash_Percent_kNN_250m_US".to_string(),
        }
    }
}

impl Validate for PercentCoverConfig {
    fn validate(&self) -> Result<()> {
        require(self.chunk_batch_size >= 1, || "chunk_batch_size must be at least 1".to_string())?;
        require(self.percent_scale.is_finite() && self.percent_scale > 0.0, || {
            format!("percent_scale must be positive, got {}", self.percent_scale)
        })?;
        require_name("target_dataset", &self.target_dataset)?;
        require_name("total_output", &self.total_output)?;
        require_name("percent_output", &self.percent_output)
    }
}
