//! Zone layers and zone-grouped statistics.
//!
//! A [`ZoneLayer`] assigns each cell of a grid to at most one zone (a
//! watershed, sub-watershed or lake basin already rasterized onto the value
//! grid). Cells outside every zone are skipped by the aggregations below;
//! that is expected coverage behaviour, not an error.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SapfluxError};
use crate::raster::{Cell, GridSpec, PixelType, Raster};

/// Partition of a grid into integer-identified zones.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneLayer {
    name: String,
    /// Attribute field the identifiers came from, e.g. "Watershed" or "LAKEBASIN".
    field: String,
    grid: GridSpec,
    zones: Vec<Option<u32>>,
    labels: BTreeMap<u32, String>,
}

impl ZoneLayer {
    pub fn new(name: impl Into<String>, field: impl Into<String>, grid: GridSpec, zones: Vec<Option<u32>>) -> Result<Self> {
        let name = name.into();
        if zones.len() != grid.len() {
            return Err(SapfluxError::InvalidZoneLayer {
                layer: name,
                reason: format!("{} zone cells for a {}x{} grid", zones.len(), grid.cols, grid.rows),
            });
        }
        Ok(Self {
            name,
            field: field.into(),
            grid,
            zones,
            labels: BTreeMap::new(),
        })
    }

    /// Read zone ids from an integer raster. Zero and NoData mean "no zone";
    /// negative or fractional values are rejected.
    pub fn from_raster(name: impl Into<String>, field: impl Into<String>, raster: &Raster) -> Result<Self> {
        let name = name.into();
        let zones = raster
            .cells()
            .iter()
            .map(|c| match *c {
                Cell::NoData => Ok(None),
                Cell::Valid(v) if v == 0.0 => Ok(None),
                Cell::Valid(v) if v > 0.0 && v.fract() == 0.0 && v <= u32::MAX as f32 => Ok(Some(v as u32)),
                Cell::Valid(v) => Err(SapfluxError::InvalidZoneLayer {
                    layer: name.clone(),
                    reason: format!("{v} is not a zone identifier"),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(name, field, *raster.grid(), zones)
    }

    pub fn with_labels(mut self, labels: BTreeMap<u32, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn labels(&self) -> &BTreeMap<u32, String> {
        &self.labels
    }

    #[inline]
    pub fn zone_at(&self, idx: usize) -> Option<u32> {
        self.zones[idx]
    }

    pub fn zone_ids(&self) -> BTreeSet<u32> {
        self.zones.iter().flatten().copied().collect()
    }

    /// Merge zones through `mapping` (fine id -> coarse id). Unmapped zones
    /// fall outside the coarse layer.
    pub fn coarsen(&self, name: impl Into<String>, field: impl Into<String>, mapping: &BTreeMap<u32, u32>) -> Result<ZoneLayer> {
        let zones = self
            .zones
            .iter()
            .map(|z| z.and_then(|id| mapping.get(&id).copied()))
            .collect();
        ZoneLayer::new(name, field, self.grid, zones)
    }

    /// Integer raster of zone ids, NoData outside every zone.
    pub fn to_raster(&self) -> Raster {
        let cells = self
            .zones
            .iter()
            .map(|z| z.map_or(Cell::NoData, |id| Cell::Valid(id as f32)))
            .collect();
        Raster::from_parts(self.grid, cells).with_pixel_type(PixelType::Int32)
    }
}

/// Aggregate for one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSummary {
    pub zone: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub sum: f64,
    /// Valid cells that contributed.
    pub count: usize,
}

/// Zone -> sum mapping produced by [`zonal_sum`].
///
/// Only zones with at least one valid cell are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonalTable {
    pub layer: String,
    pub field: String,
    pub zones: BTreeMap<u32, ZoneSummary>,
}

impl ZonalTable {
    pub fn sum(&self, zone: u32) -> Option<f64> {
        self.zones.get(&zone).map(|z| z.sum)
    }

    /// Sum over all zones.
    pub fn total(&self) -> f64 {
        self.zones.values().map(|z| z.sum).sum()
    }

    /// Spread each zone's sum back over its cells; other cells are NoData.
    pub fn to_raster(&self, layer: &ZoneLayer) -> Raster {
        let cells = (0..layer.grid.len())
            .map(|i| {
                layer
                    .zone_at(i)
                    .and_then(|id| self.sum(id))
                    .map_or(Cell::NoData, Cell::from_f64)
            })
            .collect();
        Raster::from_parts(layer.grid, cells)
    }
}

/// Sum valid cells of `values` per zone. NoData cells are excluded, not zeroed.
pub fn zonal_sum(values: &Raster, zones: &ZoneLayer) -> Result<ZonalTable> {
    zones.grid.ensure_aligned(values.grid())?;
    let mut acc: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
    for (i, cell) in values.cells().iter().enumerate() {
        if let (Some(zone), Cell::Valid(v)) = (zones.zone_at(i), cell) {
            let entry = acc.entry(zone).or_insert((0.0, 0));
            entry.0 += f64::from(*v);
            entry.1 += 1;
        }
    }
    let summaries = acc
        .into_iter()
        .map(|(zone, (sum, count))| {
            let label = zones.labels.get(&zone).cloned();
            (zone, ZoneSummary { zone, label, sum, count })
        })
        .collect();
    Ok(ZonalTable {
        layer: zones.name.clone(),
        field: zones.field.clone(),
        zones: summaries,
    })
}

/// One row of a raster attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRow {
    pub value: i64,
    pub count: usize,
}

/// Distinct values of an integer raster with their cell counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeTable {
    pub rows: Vec<AttributeRow>,
}

/// Build the attribute table of an integer raster. Float rasters are rejected.
pub fn build_attribute_table(raster: &Raster) -> Result<AttributeTable> {
    if raster.pixel_type() != PixelType::Int32 {
        return Err(SapfluxError::config(
            "attribute tables can only be built for integer rasters",
        ));
    }
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for v in raster.valid_values() {
        *counts.entry(v as i64).or_default() += 1;
    }
    Ok(AttributeTable {
        rows: counts
            .into_iter()
            .map(|(value, count)| AttributeRow { value, count })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid() -> GridSpec {
        GridSpec::new(3, 2, 250.0, 0.0, 500.0)
    }

    fn values(vals: &[Option<f32>]) -> Raster {
        Raster::from_cells(grid(), vals.iter().map(|&v| Cell::from(v)).collect()).unwrap()
    }

    fn fine_zones() -> ZoneLayer {
        // 1 1 2
        // 3 3 2
        ZoneLayer::new(
            "subwatersheds",
            "Watershed",
            grid(),
            vec![Some(1), Some(1), Some(2), Some(3), Some(3), Some(2)],
        )
        .unwrap()
    }

    #[test]
    fn sums_per_zone_skip_nodata() {
        let v = values(&[Some(1.0), None, Some(2.0), Some(4.0), Some(8.0), Some(16.0)]);
        let t = zonal_sum(&v, &fine_zones()).unwrap();
        assert_eq!(t.sum(1), Some(1.0));
        assert_eq!(t.zones[&1].count, 1);
        assert_eq!(t.sum(2), Some(18.0));
        assert_eq!(t.sum(3), Some(12.0));
    }

    #[test]
    fn zone_with_only_nodata_is_absent() {
        let v = values(&[None, None, Some(2.0), Some(4.0), Some(8.0), Some(16.0)]);
        let t = zonal_sum(&v, &fine_zones()).unwrap();
        assert_eq!(t.sum(1), None);
        let r = t.to_raster(&fine_zones());
        assert_eq!(r.get(0, 0), Cell::NoData);
        assert_eq!(r.get(1, 2), Cell::Valid(18.0));
    }

    #[test]
    fn fine_and_coarse_sums_conserve_mass() {
        let v = values(&[Some(0.5), Some(1.5), Some(2.0), Some(4.0), None, Some(16.0)]);
        let fine = fine_zones();
        let mapping = BTreeMap::from([(1, 10), (2, 10), (3, 20)]);
        let coarse = fine.coarsen("lake_basins", "LAKEBASIN", &mapping).unwrap();
        let fine_total = zonal_sum(&v, &fine).unwrap().total();
        let coarse_table = zonal_sum(&v, &coarse).unwrap();
        assert_relative_eq!(fine_total, v.sum(), epsilon = 1e-9);
        assert_relative_eq!(coarse_table.total(), v.sum(), epsilon = 1e-9);
        assert_eq!(coarse_table.sum(10), Some(20.0));
    }

    #[test]
    fn uncovered_cells_are_excluded() {
        let zones = ZoneLayer::new("partial", "Watershed", grid(), vec![Some(1), None, None, None, None, Some(1)]).unwrap();
        let v = values(&[Some(1.0); 6]);
        let t = zonal_sum(&v, &zones).unwrap();
        assert_eq!(t.sum(1), Some(2.0));
        assert_eq!(t.zones.len(), 1);
    }

    #[test]
    fn misaligned_zones_are_rejected() {
        let zones = ZoneLayer::new(
            "shifted",
            "Watershed",
            GridSpec::new(3, 2, 250.0, 250.0, 500.0),
            vec![Some(1); 6],
        )
        .unwrap();
        let v = values(&[Some(1.0); 6]);
        assert!(matches!(zonal_sum(&v, &zones), Err(SapfluxError::Alignment(_))));
    }

    #[test]
    fn from_raster_reads_ids_and_rejects_fractions() {
        let ids = values(&[Some(1.0), Some(0.0), None, Some(2.0), Some(2.0), Some(7.0)]);
        let layer = ZoneLayer::from_raster("z", "Watershed", &ids).unwrap();
        assert_eq!(layer.zone_ids(), BTreeSet::from([1, 2, 7]));
        assert_eq!(layer.zone_at(1), None);

        let bad = values(&[Some(1.5); 6]);
        assert!(matches!(
            ZoneLayer::from_raster("z", "Watershed", &bad),
            Err(SapfluxError::InvalidZoneLayer { .. })
        ));
    }

    #[test]
    fn labels_flow_into_summaries() {
        let layer = fine_zones().with_labels(BTreeMap::from([(1, "Superior".to_string())]));
        let t = zonal_sum(&values(&[Some(1.0); 6]), &layer).unwrap();
        assert_eq!(t.zones[&1].label.as_deref(), Some("Superior"));
        assert_eq!(t.zones[&2].label, None);
    }

    #[test]
    fn attribute_table_counts_values() {
        let r = values(&[Some(3.9), Some(3.2), None, Some(1.0), Some(1.0), Some(1.0)])
            .with_pixel_type(PixelType::Int32);
        let table = build_attribute_table(&r).unwrap();
        assert_eq!(
            table.rows,
            vec![AttributeRow { value: 1, count: 3 }, AttributeRow { value: 3, count: 2 }]
        );
        assert!(build_attribute_table(&values(&[Some(1.0); 6])).is_err());
    }
}
