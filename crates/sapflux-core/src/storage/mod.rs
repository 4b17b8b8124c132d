//! Named raster datasets.
//!
//! Pipelines address inputs and outputs by dataset name through
//! [`RasterStore`]. [`GeoTiffStore`] maps names to `.tif` files in a
//! directory; [`MemoryStore`] keeps everything in process.
pub mod geotiff;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Result, SapfluxError};
use crate::raster::Raster;
use crate::zonal::ZoneLayer;

pub use geotiff::{GeoTiffStore, ZoneSidecar};

/// Read/write access to named rasters and their sidecar tables.
///
/// Writes replace any existing dataset of the same name, and a failed write
/// leaves no partial dataset behind.
pub trait RasterStore: Send + Sync {
    fn read_raster(&self, name: &str) -> Result<Raster>;

    fn write_raster(&self, name: &str, raster: &Raster) -> Result<()>;

    fn delete_raster(&self, name: &str) -> Result<()>;

    /// Dataset names, sorted.
    fn list_rasters(&self) -> Result<Vec<String>>;

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.list_rasters()?.iter().any(|n| n == name))
    }

    /// Load a rasterized zone layer identified by `field`.
    fn read_zones(&self, name: &str, field: &str) -> Result<ZoneLayer> {
        ZoneLayer::from_raster(name, field, &self.read_raster(name)?)
    }

    /// Store a JSON table (zonal summary, attribute table) under `name`.
    fn write_table(&self, name: &str, table: &serde_json::Value) -> Result<()>;
}

/// In-process store. Clones share the same datasets.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rasters: Arc<RwLock<HashMap<String, Raster>>>,
    tables: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a dataset, builder style.
    pub fn with_raster(self, name: &str, raster: Raster) -> Self {
        self.rasters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), raster);
        self
    }

    pub fn table(&self, name: &str) -> Option<serde_json::Value> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl RasterStore for MemoryStore {
    fn read_raster(&self, name: &str) -> Result<Raster> {
        self.rasters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| SapfluxError::MissingDataset(name.to_string()))
    }

    fn write_raster(&self, name: &str, raster: &Raster) -> Result<()> {
        self.rasters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), raster.clone());
        Ok(())
    }

    fn delete_raster(&self, name: &str) -> Result<()> {
        self.rasters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SapfluxError::MissingDataset(name.to_string()))
    }

    fn list_rasters(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .rasters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn write_table(&self, name: &str, table: &serde_json::Value) -> Result<()> {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), table.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Cell, GridSpec};

    fn raster(v: f32) -> Raster {
        Raster::filled(GridSpec::new(2, 2, 250.0, 0.0, 500.0), Cell::Valid(v))
    }

    #[test]
    fn clones_share_datasets() {
        let store = MemoryStore::new();
        let view = store.clone();
        store.write_raster("b", &raster(1.0)).unwrap();
        store.write_raster("a", &raster(2.0)).unwrap();
        assert_eq!(view.list_rasters().unwrap(), vec!["a", "b"]);
        assert_eq!(view.read_raster("a").unwrap(), raster(2.0));
    }

    #[test]
    fn writes_overwrite_and_deletes_remove() {
        let store = MemoryStore::new().with_raster("x", raster(1.0));
        store.write_raster("x", &raster(5.0)).unwrap();
        assert_eq!(store.read_raster("x").unwrap(), raster(5.0));
        store.delete_raster("x").unwrap();
        assert!(!store.contains("x").unwrap());
        assert!(matches!(store.read_raster("x"), Err(SapfluxError::MissingDataset(_))));
        assert!(store.delete_raster("x").is_err());
    }

    #[test]
    fn zones_read_from_integer_raster() {
        let store = MemoryStore::new().with_raster("basins", raster(3.0));
        let zones = store.read_zones("basins", "LAKEBASIN").unwrap();
        assert_eq!(zones.field(), "LAKEBASIN");
        assert_eq!(zones.zone_ids().into_iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn tables_are_kept() {
        let store = MemoryStore::new();
        store.write_table("t", &serde_json::json!({ "1": 2.5 })).unwrap();
        assert_eq!(store.table("t").unwrap()["1"], 2.5);
    }
}
