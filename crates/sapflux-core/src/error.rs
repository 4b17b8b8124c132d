//! Error types for the sapflux pipeline.

use thiserror::Error;

/// Errors raised by raster operations, pipelines and storage.
#[derive(Debug, Error)]
pub enum SapfluxError {
    /// A required constant or path is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two rasters in one operation do not share a grid.
    #[error("alignment error: {0}")]
    Alignment(String),

    /// A statistic needed for normalization is zero, negative or undefined.
    #[error("undefined statistic: {statistic} of {dataset} is {value}")]
    UndefinedStatistic {
        /// Dataset the statistic was computed over.
        dataset: String,
        /// Statistic name ("mean", "max").
        statistic: &'static str,
        /// Offending value, NaN when there were no valid cells.
        value: f64,
    },

    /// One batch of a chunked reduction failed; no partial total is returned.
    #[error("chunked reduction failed at level {level}, batch {batch}: {source}")]
    PartialChunkFailure {
        /// Depth in the reduction tree (0 = input layers).
        level: usize,
        /// Batch index within that level.
        batch: usize,
        #[source]
        source: Box<SapfluxError>,
    },

    /// An operation that needs at least one input received none.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// A zone raster holds values that are not zone identifiers.
    #[error("invalid zone layer {layer}: {reason}")]
    InvalidZoneLayer {
        layer: String,
        reason: String,
    },

    /// A named dataset does not exist in the store.
    #[error("dataset not found: {0}")]
    MissingDataset(String),

    /// I/O error reading or writing a dataset.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// JSON (de)serialization error for configs and sidecar tables.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// GeoTIFF is missing georeferencing tags or has inconsistent ones.
    #[error("invalid GeoTIFF {path}: {reason}")]
    InvalidGeoTiff {
        path: String,
        reason: String,
    },

    /// Sample format the raster model cannot hold.
    #[error("unsupported TIFF data type: {0}")]
    UnsupportedDataType(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SapfluxError>;

impl SapfluxError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn alignment(msg: impl Into<String>) -> Self {
        Self::Alignment(msg.into())
    }
}
