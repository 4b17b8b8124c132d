//! Where a pipeline run reads and writes.
use std::path::Path;
use std::sync::Arc;

use crate::storage::{GeoTiffStore, MemoryStore, RasterStore};

/// Stores handed to every pipeline stage. Nothing is process-global.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Source datasets.
    pub inputs: Arc<dyn RasterStore>,
    /// Rasterized zone layers. Defaults to `inputs`.
    pub zones: Arc<dyn RasterStore>,
    /// Raster outputs.
    pub outputs: Arc<dyn RasterStore>,
    /// Zonal rasters and their tables.
    pub zonal: Arc<dyn RasterStore>,
    /// Intermediate chunk results.
    pub scratch: Arc<dyn RasterStore>,
}

impl ExecutionContext {
    pub fn new(
        inputs: Arc<dyn RasterStore>,
        outputs: Arc<dyn RasterStore>,
        zonal: Arc<dyn RasterStore>,
        scratch: Arc<dyn RasterStore>,
    ) -> Self {
        Self {
            zones: Arc::clone(&inputs),
            inputs,
            outputs,
            zonal,
            scratch,
        }
    }

    /// GeoTIFF directories: zonal outputs under `<output>/Zonal`, chunk
    /// results under `<output>/Chunk_Maps`.
    pub fn on_disk(input_dir: &Path, output_dir: &Path) -> Self {
        Self::new(
            Arc::new(GeoTiffStore::new(input_dir)),
            Arc::new(GeoTiffStore::new(output_dir)),
            Arc::new(GeoTiffStore::new(output_dir.join("Zonal"))),
            Arc::new(GeoTiffStore::new(output_dir.join("Chunk_Maps"))),
        )
    }

    /// One shared in-memory store for every role.
    pub fn in_memory(store: &MemoryStore) -> Self {
        let shared: Arc<dyn RasterStore> = Arc::new(store.clone());
        Self::new(Arc::clone(&shared), Arc::clone(&shared), Arc::clone(&shared), shared)
    }

    pub fn with_zones(mut self, zones: Arc<dyn RasterStore>) -> Self {
        self.zones = zones;
        self
    }
}

/// Output-name suffix recording the basal area threshold, e.g. `_BA_Trimmed_20`.
pub fn threshold_suffix(minimum_basal_area: f64) -> String {
    let value = format!("{minimum_basal_area}").replace('.', "p");
    format!("_BA_Trimmed_{value}")
}
