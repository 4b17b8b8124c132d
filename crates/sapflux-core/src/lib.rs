//! Raster algebra and reduction pipeline for estimating basin-scale tree
//! water use from basal area maps.
pub mod algebra;
pub mod chunked;
pub mod config;
pub mod context;
pub mod error;
pub mod mosaic;
pub mod pipeline;
pub mod raster;
pub mod stats;
pub mod storage;
pub mod zonal;

pub use chunked::{ChunkedReducer, NoDataPolicy, Statistic};
pub use context::{threshold_suffix, ExecutionContext};
pub use error::{Result, SapfluxError};
pub use mosaic::{mosaic, MosaicMethod};
pub use raster::{Cell, GridSpec, PixelType, Raster};
pub use stats::{compute_stats, AdjustmentFactor, RasterStats};
pub use storage::{GeoTiffStore, MemoryStore, RasterStore};
pub use zonal::{zonal_sum, ZonalTable, ZoneLayer};
