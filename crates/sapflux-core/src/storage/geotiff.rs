//! Directory of single-band GeoTIFF datasets.
//!
//! Georeferencing uses the ModelPixelScale (33550) and ModelTiepoint (33922)
//! tags with the tie point at the upper-left corner; NoData is the
//! GDAL_NODATA (42113) ASCII tag. Float rasters are written as 32-bit float
//! samples and integer rasters as 32-bit signed samples.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::{debug, info};

use crate::error::{Result, SapfluxError};
use crate::raster::{GridSpec, PixelType, Raster};
use crate::storage::RasterStore;
use crate::zonal::ZoneLayer;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GDAL_NODATA: u16 = 42113;

const FLOAT_NODATA: f32 = f32::MIN;
const INT_NODATA: i32 = i32::MIN;

fn geo_tag(code: u16) -> Tag {
    // Resolves to the named variant when the tiff crate knows the code.
    Tag::from_u16_exhaustive(code)
}

/// Optional `<name>.zones.json` next to a zone raster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneSidecar {
    /// Attribute field the ids came from; checked against the requested field.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<u32, String>,
}

/// GeoTIFF-backed [`RasterStore`] rooted at one directory.
#[derive(Debug, Clone)]
pub struct GeoTiffStore {
    root: PathBuf,
}

impl GeoTiffStore {
    /// The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.tif"))
    }

    fn sidecar_path(&self, name: &str, suffix: &str) -> PathBuf {
        self.root.join(format!("{name}.{suffix}.json"))
    }

    /// Write through a hidden sibling, then rename over `dest`.
    fn write_atomic<F>(&self, dest: &Path, write: F) -> Result<()>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<()>,
    {
        fs::create_dir_all(&self.root)?;
        let file_name = dest
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SapfluxError::config(format!("bad output path {}", dest.display())))?;
        let partial = self.root.join(format!(".{file_name}.partial"));
        let result = File::create(&partial)
            .map_err(SapfluxError::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                write(&mut writer)?;
                writer.flush()?;
                Ok(())
            })
            .and_then(|()| fs::rename(&partial, dest).map_err(SapfluxError::from));
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}

/// Decode a single-band GeoTIFF.
pub fn read_geotiff(path: &Path) -> Result<Raster> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

    match decoder.colortype()? {
        ColorType::Gray(_) => {}
        other => {
            return Err(SapfluxError::UnsupportedDataType(format!(
                "{}: {other:?} (single-band rasters only)",
                path.display()
            )))
        }
    }

    let (width, height) = decoder.dimensions()?;
    let grid = read_grid(&mut decoder, path, width as usize, height as usize)?;
    let nodata = decoder
        .get_tag_ascii_string(geo_tag(GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim().trim_end_matches('\0').parse::<f64>().ok());

    let (values, pixel_type) = match decoder.read_image()? {
        DecodingResult::F32(data) => (data, PixelType::Float32),
        DecodingResult::F64(data) => (data.into_iter().map(|v| v as f32).collect(), PixelType::Float32),
        DecodingResult::U8(data) => (data.into_iter().map(f32::from).collect(), PixelType::Int32),
        DecodingResult::U16(data) => (data.into_iter().map(f32::from).collect(), PixelType::Int32),
        DecodingResult::U32(data) => (data.into_iter().map(|v| v as f32).collect(), PixelType::Int32),
        DecodingResult::U64(data) => (data.into_iter().map(|v| v as f32).collect(), PixelType::Int32),
        DecodingResult::I8(data) => (data.into_iter().map(f32::from).collect(), PixelType::Int32),
        DecodingResult::I16(data) => (data.into_iter().map(f32::from).collect(), PixelType::Int32),
        DecodingResult::I32(data) => (data.into_iter().map(|v| v as f32).collect(), PixelType::Int32),
        DecodingResult::I64(data) => (data.into_iter().map(|v| v as f32).collect(), PixelType::Int32),
    };
    if values.len() != grid.len() {
        return Err(SapfluxError::InvalidGeoTiff {
            path: path.display().to_string(),
            reason: format!("{} samples for {}x{} pixels", values.len(), width, height),
        });
    }

    let raster = Raster::from_values(grid, &values, nodata.map(|v| v as f32))?;
    debug!(path = %path.display(), cols = grid.cols, rows = grid.rows, "read raster");
    Ok(match pixel_type {
        PixelType::Int32 => raster.with_pixel_type(PixelType::Int32),
        PixelType::Float32 => raster,
    })
}

fn read_grid<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path, cols: usize, rows: usize) -> Result<GridSpec> {
    let invalid = |reason: &str| SapfluxError::InvalidGeoTiff {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };
    let scale = decoder
        .get_tag_f64_vec(geo_tag(MODEL_PIXEL_SCALE))
        .map_err(|_| invalid("missing ModelPixelScale tag"))?;
    let tiepoint = decoder
        .get_tag_f64_vec(geo_tag(MODEL_TIEPOINT))
        .map_err(|_| invalid("missing ModelTiepoint tag"))?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(invalid("truncated georeferencing tags"));
    }
    let (sx, sy) = (scale[0], scale[1]);
    if !(sx > 0.0 && (sx - sy).abs() <= sx * 1e-9) {
        return Err(invalid("cells must be square"));
    }
    // Tie point [i, j, k, x, y, z] maps pixel (i, j) to map (x, y).
    let x_min = tiepoint[3] - tiepoint[0] * sx;
    let y_max = tiepoint[4] + tiepoint[1] * sy;
    Ok(GridSpec::new(cols, rows, sx, x_min, y_max))
}

/// Truncate a valid cell to an Int32 sample. `INT_NODATA` is reserved, so
/// the representable range is `(i32::MIN, i32::MAX]`.
fn int_sample(v: f32) -> Result<i32> {
    let t = f64::from(v).trunc();
    if !t.is_finite() || t <= f64::from(INT_NODATA) || t > f64::from(i32::MAX) {
        return Err(SapfluxError::UnsupportedDataType(format!(
            "value {v} does not fit an Int32 raster"
        )));
    }
    Ok(t as i32)
}

/// Encode `raster` as a single-band GeoTIFF into `writer`.
pub fn write_geotiff<W: Write + Seek>(writer: &mut W, raster: &Raster) -> Result<()> {
    let grid = raster.grid();
    let (width, height) = (grid.cols as u32, grid.rows as u32);
    let scale = [grid.cell_size, grid.cell_size, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, grid.x_min, grid.y_max, 0.0];
    let mut encoder = TiffEncoder::new(writer)?;

    match raster.pixel_type() {
        PixelType::Float32 => {
            let mut image = encoder.new_image::<colortype::Gray32Float>(width, height)?;
            image.encoder().write_tag(geo_tag(MODEL_PIXEL_SCALE), &scale[..])?;
            image.encoder().write_tag(geo_tag(MODEL_TIEPOINT), &tiepoint[..])?;
            image
                .encoder()
                .write_tag(geo_tag(GDAL_NODATA), format!("{FLOAT_NODATA:e}").as_str())?;
            image.write_data(&raster.to_values(FLOAT_NODATA))?;
        }
        PixelType::Int32 => {
            let data = raster
                .cells()
                .iter()
                .map(|c| c.value().map_or(Ok(INT_NODATA), int_sample))
                .collect::<Result<Vec<i32>>>()?;
            let mut image = encoder.new_image::<colortype::GrayI32>(width, height)?;
            image.encoder().write_tag(geo_tag(MODEL_PIXEL_SCALE), &scale[..])?;
            image.encoder().write_tag(geo_tag(MODEL_TIEPOINT), &tiepoint[..])?;
            image
                .encoder()
                .write_tag(geo_tag(GDAL_NODATA), INT_NODATA.to_string().as_str())?;
            image.write_data(&data)?;
        }
    }
    Ok(())
}

impl RasterStore for GeoTiffStore {
    fn read_raster(&self, name: &str) -> Result<Raster> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Err(SapfluxError::MissingDataset(path.display().to_string()));
        }
        read_geotiff(&path)
    }

    fn write_raster(&self, name: &str, raster: &Raster) -> Result<()> {
        let path = self.path_of(name);
        self.write_atomic(&path, |w| write_geotiff(w, raster))?;
        info!(path = %path.display(), "wrote raster");
        Ok(())
    }

    fn delete_raster(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Err(SapfluxError::MissingDataset(path.display().to_string()));
        }
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "deleted raster");
        Ok(())
    }

    fn list_rasters(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_tif = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"));
            if let (true, Some(stem)) = (is_tif, path.file_stem().and_then(|s| s.to_str())) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Zone raster plus optional `<name>.zones.json` labels.
    fn read_zones(&self, name: &str, field: &str) -> Result<ZoneLayer> {
        let layer = ZoneLayer::from_raster(name, field, &self.read_raster(name)?)?;
        let sidecar_path = self.sidecar_path(name, "zones");
        if !sidecar_path.is_file() {
            return Ok(layer);
        }
        let sidecar: ZoneSidecar = serde_json::from_str(&fs::read_to_string(&sidecar_path)?)?;
        if let Some(stored) = sidecar.field.as_deref() {
            if stored != field {
                return Err(SapfluxError::InvalidZoneLayer {
                    layer: name.to_string(),
                    reason: format!("zones were built from field {stored}, not {field}"),
                });
            }
        }
        Ok(layer.with_labels(sidecar.labels))
    }

    fn write_table(&self, name: &str, table: &serde_json::Value) -> Result<()> {
        let path = self.root.join(format!("{name}.json"));
        self.write_atomic(&path, |w| {
            serde_json::to_writer_pretty(&mut *w, table)?;
            Ok(())
        })?;
        info!(path = %path.display(), "wrote table");
        Ok(())
    }
}
