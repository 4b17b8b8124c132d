//! End-to-end stages run by the command-line tools.
pub mod basal_area;
pub mod percent_cover;
pub mod water_use;

pub use basal_area::{run_basal_area, unify_basal_area, BasalAreaReport, UnifiedBasalArea};
pub use percent_cover::{percent_of_total, run_percent_cover, total_cover, PercentCoverReport};
pub use water_use::{
    estimate_water_use, run_water_use, scenario_flux, sapwood_area, threshold_basal_area, to_gallons,
    WaterUseEstimate, WaterUseReport,
};
