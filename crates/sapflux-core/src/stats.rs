//! Global raster statistics and cross-dataset unit normalization.
//!
//! Two datasets that measure the same quantity in different units are
//! reconciled with a known linear conversion `target = m * source`, corrected
//! by the average of a mean-based and a max-based ratio between the datasets.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algebra;
use crate::error::{Result, SapfluxError};
use crate::raster::Raster;

/// Summary over the valid (non-NoData) cells of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterStats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Compute mean/min/max/sum over valid cells. `None` if every cell is NoData.
pub fn compute_stats(raster: &Raster) -> Option<RasterStats> {
    let mut count = 0usize;
    let mut sum = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in raster.valid_values().map(f64::from) {
        count += 1;
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }
    (count > 0).then(|| RasterStats {
        count,
        sum,
        mean: sum / count as f64,
        min,
        max,
    })
}

/// Correction applied on top of a unit conversion constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentFactor {
    /// `(mean(R) / m) / mean(S)`
    pub mean_adjust: f64,
    /// `(max(R) / m) / max(S)`
    pub max_adjust: f64,
    /// Average of the two ratios.
    pub factor: f64,
}

fn require_positive(dataset: &str, statistic: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(SapfluxError::UndefinedStatistic {
            dataset: dataset.to_string(),
            statistic,
            value,
        })
    }
}

impl AdjustmentFactor {
    /// Derive the factor from precomputed statistics.
    ///
    /// `reference` is already in target units; `source` is in raw units and
    /// `m` converts raw to target units.
    pub fn from_stats(reference: &RasterStats, source: &RasterStats, m: f64) -> Result<Self> {
        if !(m.is_finite() && m > 0.0) {
            return Err(SapfluxError::config(format!(
                "unit conversion constant must be positive, got {m}"
            )));
        }
        let r_mean = require_positive("reference", "mean", reference.mean)?;
        let r_max = require_positive("reference", "max", reference.max)?;
        let s_mean = require_positive("source", "mean", source.mean)?;
        let s_max = require_positive("source", "max", source.max)?;

        let mean_adjust = (r_mean / m) / s_mean;
        let max_adjust = (r_max / m) / s_max;
        Ok(Self {
            mean_adjust,
            max_adjust,
            factor: (mean_adjust + max_adjust) / 2.0,
        })
    }

    /// Compute statistics of both rasters and derive the factor.
    pub fn from_rasters(reference: &Raster, source: &Raster, m: f64) -> Result<Self> {
        let r = compute_stats(reference).ok_or_else(|| SapfluxError::UndefinedStatistic {
            dataset: "reference".into(),
            statistic: "mean",
            value: f64::NAN,
        })?;
        let s = compute_stats(source).ok_or_else(|| SapfluxError::UndefinedStatistic {
            dataset: "source".into(),
            statistic: "mean",
            value: f64::NAN,
        })?;
        debug!(
            reference_mean = r.mean,
            reference_max = r.max,
            source_mean = s.mean,
            source_max = s.max,
            "dataset statistics"
        );
        Self::from_stats(&r, &s, m)
    }

    /// `m * source * factor`, NoData preserved.
    pub fn apply(&self, source: &Raster, m: f64) -> Raster {
        let scale = m * self.factor;
        algebra::map(source, |v| v * scale)
    }
}
