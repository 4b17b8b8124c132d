//! Basal area -> daily water use, per flux scenario and zone granularity.
//!
//! ```text
//! trimmed = Con(BA > minimum, BA, 0)
//! sapwood = intercept + slope * trimmed
//! flux    = Con(trimmed > 0, rate * sapwood * cell_area, 0)   ft³/day per cell
//! gallons = flux * gallons_per_cubic_foot
//! ```
//!
//! NoData basal area stays NoData through every step. Zonal sums exclude it.
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::algebra;
use crate::config::{OutputUnit, SapwoodRegression, WaterUseConfig, ZoneLayerSpec};
use crate::context::{threshold_suffix, ExecutionContext};
use crate::error::Result;
use crate::raster::Raster;
use crate::zonal::{build_attribute_table, zonal_sum, AttributeTable, ZonalTable, ZoneLayer};

/// Zero out basal area at or below `minimum`.
pub fn threshold_basal_area(basal_area: &Raster, minimum: f64) -> Result<Raster> {
    algebra::con(basal_area, |v| f64::from(v) > minimum, basal_area, 0.0)
}

/// Sapwood area (ft²/ac) from basal area (ft²/ac).
pub fn sapwood_area(trimmed: &Raster, regression: &SapwoodRegression) -> Raster {
    let SapwoodRegression { intercept, slope } = *regression;
    algebra::map(trimmed, |ba| intercept + slope * ba)
}

/// Cubic feet per day per cell for one flux rate. Cells without ash are 0.
pub fn scenario_flux(trimmed: &Raster, sapwood: &Raster, rate: f64, cell_area_acres: f64) -> Result<Raster> {
    let raw = algebra::map(sapwood, |sa| rate * sa * cell_area_acres);
    algebra::con(trimmed, |v| v > 0.0, &raw, 0.0)
}

pub fn to_gallons(cubic_feet: &Raster, gallons_per_cubic_foot: f64) -> Raster {
    algebra::map(cubic_feet, |v| v * gallons_per_cubic_foot)
}

/// Per-cell water use for one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioRasters {
    pub cubic_feet: Raster,
    pub gallons: Raster,
}

impl ScenarioRasters {
    pub fn in_units(&self, unit: OutputUnit) -> &Raster {
        match unit {
            OutputUnit::CubicFeet => &self.cubic_feet,
            OutputUnit::Gallons => &self.gallons,
        }
    }
}

/// Everything derived from one basal area raster.
#[derive(Debug, Clone)]
pub struct WaterUseEstimate {
    pub trimmed: Raster,
    pub sapwood: Raster,
    pub scenarios: BTreeMap<String, ScenarioRasters>,
}

/// Compute every scenario without touching storage.
pub fn estimate_water_use(basal_area: &Raster, config: &WaterUseConfig) -> Result<WaterUseEstimate> {
    let trimmed = threshold_basal_area(basal_area, config.minimum_basal_area)?;
    let sapwood = sapwood_area(&trimmed, &config.regression);
    let cell_area = config.cell_area_acres();
    let mut scenarios = BTreeMap::new();
    for (name, &rate) in &config.flux_scenarios {
        let cubic_feet = scenario_flux(&trimmed, &sapwood, rate, cell_area)?;
        let gallons = to_gallons(&cubic_feet, config.gallons_per_cubic_foot);
        debug!(scenario = %name, rate, total_ft3 = cubic_feet.sum(), "scenario computed");
        scenarios.insert(name.clone(), ScenarioRasters { cubic_feet, gallons });
    }
    Ok(WaterUseEstimate { trimmed, sapwood, scenarios })
}

/// One zonal output written by [`run_water_use`].
#[derive(Debug, Clone, Serialize)]
pub struct ZonalOutput {
    pub name: String,
    pub scenario: String,
    pub unit: OutputUnit,
    pub table: ZonalTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<AttributeTable>,
}

/// Summary of a water-use run.
#[derive(Debug, Clone, Serialize)]
pub struct WaterUseReport {
    pub trimmed_output: String,
    /// Scenario -> basin total (ft³/day).
    pub totals_cubic_feet: BTreeMap<String, f64>,
    pub rasters: Vec<String>,
    pub zonal: Vec<ZonalOutput>,
}

fn water_use_name(config: &WaterUseConfig, scenario: &str, unit: OutputUnit, suffix: &str) -> String {
    format!(
        "{}_{}_Water_Use_{}_{}{}",
        config.species_prefix,
        scenario,
        unit.label(),
        config.region,
        suffix
    )
}

fn zonal_name(config: &WaterUseConfig, scenario: &str, unit: OutputUnit, spec: &ZoneLayerSpec, suffix: &str) -> String {
    format!(
        "{}_{}_Water_Use_{}_by_{}{}",
        config.species_prefix,
        scenario,
        unit.label(),
        spec.label,
        suffix
    )
}

fn write_zonal(
    ctx: &ExecutionContext,
    name: String,
    scenario: &str,
    unit: OutputUnit,
    spec: &ZoneLayerSpec,
    zones: &ZoneLayer,
    values: &Raster,
) -> Result<ZonalOutput> {
    let table = zonal_sum(values, zones)?;
    let mut raster = table.to_raster(zones);
    let mut attributes = None;
    if spec.integer_output {
        raster = algebra::truncate_to_int(&raster);
        let vat = build_attribute_table(&raster)?;
        ctx.zonal.write_table(&format!("{name}.vat"), &serde_json::to_value(&vat)?)?;
        attributes = Some(vat);
    }
    ctx.zonal.write_raster(&name, &raster)?;
    ctx.zonal.write_table(&name, &serde_json::to_value(&table)?)?;
    info!(output = %name, zones = table.zones.len(), total = table.total(), "zonal sum written");
    Ok(ZonalOutput {
        name,
        scenario: scenario.to_string(),
        unit,
        table,
        attributes,
    })
}

/// Read `basal_area_dataset`, write the trimmed map, one water-use raster per
/// scenario and every configured zonal output.
pub fn run_water_use(ctx: &ExecutionContext, config: &WaterUseConfig, basal_area_dataset: &str) -> Result<WaterUseReport> {
    let suffix = threshold_suffix(config.minimum_basal_area);
    let basal_area = ctx.inputs.read_raster(basal_area_dataset)?;
    info!(
        dataset = basal_area_dataset,
        minimum = config.minimum_basal_area,
        cell_area_acres = config.cell_area_acres(),
        "estimating water use"
    );

    // Zone layers load and are checked against the basal area grid before
    // any output is written.
    let zone_layers = config
        .zone_layers
        .iter()
        .map(|spec| -> Result<_> {
            let zones = ctx.zones.read_zones(&spec.dataset, &spec.field)?;
            zones.grid().ensure_aligned(basal_area.grid())?;
            Ok((spec, zones))
        })
        .collect::<Result<Vec<_>>>()?;

    let estimate = estimate_water_use(&basal_area, config)?;

    let trimmed_output = format!("{basal_area_dataset}{suffix}");
    ctx.outputs.write_raster(&trimmed_output, &estimate.trimmed)?;

    let mut report = WaterUseReport {
        trimmed_output,
        totals_cubic_feet: BTreeMap::new(),
        rasters: Vec::new(),
        zonal: Vec::new(),
    };
    for (scenario, rasters) in &estimate.scenarios {
        let name = water_use_name(config, scenario, OutputUnit::CubicFeet, &suffix);
        ctx.outputs.write_raster(&name, &rasters.cubic_feet)?;
        report.rasters.push(name);
        report.totals_cubic_feet.insert(scenario.clone(), rasters.cubic_feet.sum());

        for (spec, zones) in &zone_layers {
            for &unit in &spec.units {
                let name = zonal_name(config, scenario, unit, spec, &suffix);
                let output = write_zonal(ctx, name, scenario, unit, spec, zones, rasters.in_units(unit))?;
                report.zonal.push(output);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneLayerSpec;
    use crate::raster::{Cell, GridSpec, PixelType};
    use crate::storage::{MemoryStore, RasterStore};
    use crate::error::SapfluxError;
    use approx::assert_relative_eq;

    fn grid() -> GridSpec {
        GridSpec::new(2, 2, 250.0, 0.0, 500.0)
    }

    fn raster(vals: &[Option<f32>]) -> Raster {
        Raster::from_cells(grid(), vals.iter().map(|&v| Cell::from(v)).collect()).unwrap()
    }

    fn worked_config() -> WaterUseConfig {
        WaterUseConfig {
            minimum_basal_area: 20.0,
            regression: SapwoodRegression { intercept: 1.25, slope: 0.165 },
            flux_scenarios: BTreeMap::from([("Median".to_string(), 8.36)]),
            cell_area_acres: Some(0.01544),
            zone_layers: Vec::new(),
            ..WaterUseConfig::default()
        }
    }

    #[test]
    fn worked_example_single_cell() {
        let ba = Raster::filled(GridSpec::new(1, 1, 250.0, 0.0, 250.0), Cell::Valid(25.0));
        let est = estimate_water_use(&ba, &worked_config()).unwrap();
        assert_eq!(est.trimmed.cells(), &[Cell::Valid(25.0)]);
        assert_relative_eq!(est.sapwood.cells()[0].value().unwrap(), 5.375, epsilon = 1e-6);
        let flux = est.scenarios["Median"].cubic_feet.cells()[0].value().unwrap();
        assert_relative_eq!(flux, 0.6938, epsilon = 1e-3);
    }

    #[test]
    fn threshold_is_idempotent_and_keeps_nodata() {
        let ba = raster(&[Some(10.0), Some(20.0), Some(20.5), None]);
        let once = threshold_basal_area(&ba, 20.0).unwrap();
        let twice = threshold_basal_area(&once, 20.0).unwrap();
        assert_eq!(once, twice);
        assert_eq!(
            once.cells(),
            &[Cell::Valid(0.0), Cell::Valid(0.0), Cell::Valid(20.5), Cell::NoData]
        );
    }

    #[test]
    fn cells_without_ash_use_no_water() {
        let ba = raster(&[Some(5.0), Some(40.0), None, Some(0.0)]);
        let est = estimate_water_use(&ba, &worked_config()).unwrap();
        let flux = &est.scenarios["Median"].cubic_feet;
        assert_eq!(flux.get(0, 0), Cell::Valid(0.0));
        assert!(flux.get(0, 1).value().unwrap() > 0.0);
        assert_eq!(flux.get(1, 0), Cell::NoData);
        assert_eq!(flux.get(1, 1), Cell::Valid(0.0));
    }

    #[test]
    fn gallons_round_trip_to_cubic_feet() {
        let cfg = WaterUseConfig::default();
        let ba = raster(&[Some(25.0), Some(80.0), Some(119.8), None]);
        let est = estimate_water_use(&ba, &cfg).unwrap();
        for s in est.scenarios.values() {
            for (ft3, gal) in s.cubic_feet.cells().iter().zip(s.gallons.cells()) {
                match (ft3, gal) {
                    (Cell::Valid(f), Cell::Valid(g)) => {
                        assert_relative_eq!(f64::from(*g) / cfg.gallons_per_cubic_foot, f64::from(*f), max_relative = 1e-6)
                    }
                    (Cell::NoData, Cell::NoData) => {}
                    other => panic!("mismatched cells {other:?}"),
                }
            }
        }
    }

    #[test]
    fn maximum_scenario_scales_with_rate() {
        let cfg = WaterUseConfig::default();
        let ba = raster(&[Some(60.0); 4]);
        let est = estimate_water_use(&ba, &cfg).unwrap();
        let ratio = est.scenarios["Maximum"].cubic_feet.sum() / est.scenarios["Median"].cubic_feet.sum();
        assert_relative_eq!(ratio, 20.3371 / 8.3619, max_relative = 1e-5);
    }

    fn run_fixture() -> (MemoryStore, WaterUseConfig) {
        let store = MemoryStore::new()
            .with_raster("ba", raster(&[Some(25.0), Some(10.0), Some(80.0), None]))
            .with_raster("subs", raster(&[Some(1.0), Some(1.0), Some(2.0), Some(2.0)]).with_pixel_type(PixelType::Int32))
            .with_raster("basins", raster(&[Some(7.0); 4]).with_pixel_type(PixelType::Int32));
        let cfg = WaterUseConfig {
            zone_layers: vec![
                ZoneLayerSpec {
                    dataset: "subs".into(),
                    field: "Watershed".into(),
                    label: "Subwatershed".into(),
                    units: vec![OutputUnit::CubicFeet, OutputUnit::Gallons],
                    integer_output: false,
                },
                ZoneLayerSpec {
                    dataset: "basins".into(),
                    field: "LAKEBASIN".into(),
                    label: "Lake_Basin".into(),
                    units: vec![OutputUnit::CubicFeet],
                    integer_output: true,
                },
            ],
            ..WaterUseConfig::default()
        };
        (store, cfg)
    }

    #[test]
    fn run_writes_named_outputs_and_conserves_mass() {
        let (store, cfg) = run_fixture();
        let ctx = ExecutionContext::in_memory(&store);
        let report = run_water_use(&ctx, &cfg, "ba").unwrap();

        assert_eq!(report.trimmed_output, "ba_BA_Trimmed_20");
        assert!(store.contains("Fraxinus_nigra_Median_Water_Use_cubicft_Great_Lakes_BA_Trimmed_20").unwrap());
        assert!(store.contains("Fraxinus_nigra_Median_Water_Use_gallons_by_Subwatershed_BA_Trimmed_20").unwrap());
        assert!(store.contains("Fraxinus_nigra_Maximum_Water_Use_cubicft_by_Lake_Basin_BA_Trimmed_20").unwrap());
        assert!(store.table("Fraxinus_nigra_Mean_Water_Use_cubicft_by_Lake_Basin_BA_Trimmed_20.vat").is_some());
        // Three scenarios, three zonal outputs each.
        assert_eq!(report.zonal.len(), 9);

        for out in report.zonal.iter().filter(|o| o.unit == OutputUnit::CubicFeet) {
            assert_relative_eq!(out.table.total(), report.totals_cubic_feet[&out.scenario], max_relative = 1e-6);
        }
    }

    #[test]
    fn lake_basin_output_is_integer() {
        let (store, cfg) = run_fixture();
        let ctx = ExecutionContext::in_memory(&store);
        let report = run_water_use(&ctx, &cfg, "ba").unwrap();
        let basin = store
            .read_raster("Fraxinus_nigra_Median_Water_Use_cubicft_by_Lake_Basin_BA_Trimmed_20")
            .unwrap();
        assert_eq!(basin.pixel_type(), PixelType::Int32);
        let out = report
            .zonal
            .iter()
            .find(|o| o.scenario == "Median" && o.attributes.is_some())
            .unwrap();
        let rows = &out.attributes.as_ref().unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 4);
        assert_eq!(rows[0].value, (out.table.sum(7).unwrap() as f32).trunc() as i64);
    }

    #[test]
    fn missing_zone_layer_fails_before_writing() {
        let (store, mut cfg) = run_fixture();
        cfg.zone_layers[0].dataset = "absent".into();
        let ctx = ExecutionContext::in_memory(&store);
        assert!(run_water_use(&ctx, &cfg, "ba").is_err());
        assert!(!store.contains("ba_BA_Trimmed_20").unwrap());
    }

    #[test]
    fn shifted_zone_layer_fails_before_writing() {
        let (store, cfg) = run_fixture();
        let shifted = Raster::filled(GridSpec::new(2, 2, 250.0, 250.0, 500.0), Cell::Valid(1.0))
            .with_pixel_type(PixelType::Int32);
        store.write_raster("subs", &shifted).unwrap();
        let ctx = ExecutionContext::in_memory(&store);

        let err = run_water_use(&ctx, &cfg, "ba").unwrap_err();
        assert!(matches!(err, SapfluxError::Alignment(_)));
        assert_eq!(store.list_rasters().unwrap(), vec!["ba", "basins", "subs"]);
    }
}
