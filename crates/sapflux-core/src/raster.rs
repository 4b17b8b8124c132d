//! Grid geometry and the single-band raster type.
//!
//! Cells hold `f32` values or NoData. Arithmetic elsewhere runs in `f64` and
//! narrows on store. Grids never resample: two rasters either share a lattice
//! (same cell size, origins a whole number of cells apart) or an operation
//! fails with an alignment error.
use serde::{Deserialize, Serialize};

use crate::error::{Result, SapfluxError};

/// Relative tolerance (in cells) for comparing grid origins and cell sizes.
const GRID_TOLERANCE: f64 = 1e-6;

/// One raster cell: a finite value or NoData.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Valid(f32),
    NoData,
}

impl Cell {
    /// Wrap a computed value. Non-finite results (and f64 values that
    /// overflow f32) become NoData.
    #[inline]
    pub fn from_f64(v: f64) -> Self {
        let narrowed = v as f32;
        if v.is_finite() && narrowed.is_finite() {
            Cell::Valid(narrowed)
        } else {
            Cell::NoData
        }
    }

    #[inline]
    pub fn from_f32(v: f32) -> Self {
        if v.is_finite() {
            Cell::Valid(v)
        } else {
            Cell::NoData
        }
    }

    #[inline]
    pub fn value(self) -> Option<f32> {
        match self {
            Cell::Valid(v) => Some(v),
            Cell::NoData => None,
        }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        matches!(self, Cell::Valid(_))
    }
}

impl From<Option<f32>> for Cell {
    fn from(v: Option<f32>) -> Self {
        v.map_or(Cell::NoData, Cell::from_f32)
    }
}

/// Numeric domain of a raster's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    Float32,
    /// Integer values, stored as truncated f32 in memory.
    Int32,
}

/// Grid geometry: square cells, origin at the upper-left corner, row 0 = north.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub cols: usize,
    pub rows: usize,
    /// Cell edge length in map units (metres for the basin grids).
    pub cell_size: f64,
    /// West edge.
    pub x_min: f64,
    /// North edge.
    pub y_max: f64,
}

impl GridSpec {
    pub fn new(cols: usize, rows: usize, cell_size: f64, x_min: f64, y_max: f64) -> Self {
        Self { cols, rows, cell_size, x_min, y_max }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cols * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn x_max(&self) -> f64 {
        self.x_min + self.cols as f64 * self.cell_size
    }

    pub fn y_min(&self) -> f64 {
        self.y_max - self.rows as f64 * self.cell_size
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// Column/row offset of this grid's origin measured on `other`'s lattice.
    ///
    /// Fails when the cell sizes differ or the origin falls between
    /// `other`'s cell boundaries; nothing is ever resampled.
    pub fn lattice_offset(&self, other: &GridSpec) -> Result<(isize, isize)> {
        let tol = GRID_TOLERANCE * self.cell_size.abs().max(other.cell_size.abs());
        if (self.cell_size - other.cell_size).abs() > tol {
            return Err(SapfluxError::alignment(format!(
                "cell size {} does not match {}",
                self.cell_size, other.cell_size
            )));
        }
        let dc = (self.x_min - other.x_min) / other.cell_size;
        let dr = (other.y_max - self.y_max) / other.cell_size;
        let (c, r) = (dc.round(), dr.round());
        if (dc - c).abs() > GRID_TOLERANCE || (dr - r).abs() > GRID_TOLERANCE {
            return Err(SapfluxError::alignment(format!(
                "origin ({}, {}) is not on the lattice of ({}, {}) at cell size {}",
                self.x_min, self.y_max, other.x_min, other.y_max, other.cell_size
            )));
        }
        Ok((c as isize, r as isize))
    }

    /// Require identical dimensions, cell size and origin.
    pub fn ensure_aligned(&self, other: &GridSpec) -> Result<()> {
        if self.cols != other.cols || self.rows != other.rows {
            return Err(SapfluxError::alignment(format!(
                "grid is {}x{} but expected {}x{}",
                other.cols, other.rows, self.cols, self.rows
            )));
        }
        match self.lattice_offset(other)? {
            (0, 0) => Ok(()),
            (c, r) => Err(SapfluxError::alignment(format!(
                "extent is shifted by {c} columns and {r} rows"
            ))),
        }
    }

    /// Smallest grid on this grid's lattice covering both extents.
    pub fn union(&self, other: &GridSpec) -> Result<GridSpec> {
        let (c, r) = other.lattice_offset(self)?;
        let min_c = c.min(0);
        let min_r = r.min(0);
        let max_c = (c + other.cols as isize).max(self.cols as isize);
        let max_r = (r + other.rows as isize).max(self.rows as isize);
        Ok(GridSpec {
            cols: (max_c - min_c) as usize,
            rows: (max_r - min_r) as usize,
            cell_size: self.cell_size,
            x_min: self.x_min + min_c as f64 * self.cell_size,
            y_max: self.y_max - min_r as f64 * self.cell_size,
        })
    }
}

/// A single-band raster. Row-major cells, row 0 = north edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    grid: GridSpec,
    pixel_type: PixelType,
    cells: Vec<Cell>,
}

impl Raster {
    /// Float raster with every cell set to `fill`.
    pub fn filled(grid: GridSpec, fill: Cell) -> Self {
        Self {
            grid,
            pixel_type: PixelType::Float32,
            cells: vec![fill; grid.len()],
        }
    }

    pub fn from_cells(grid: GridSpec, cells: Vec<Cell>) -> Result<Self> {
        if cells.len() != grid.len() {
            return Err(SapfluxError::alignment(format!(
                "{} cells supplied for a {}x{} grid",
                cells.len(),
                grid.cols,
                grid.rows
            )));
        }
        Ok(Self { grid, pixel_type: PixelType::Float32, cells })
    }

    /// Build from raw samples; values equal to `nodata` or non-finite become NoData.
    pub fn from_values(grid: GridSpec, values: &[f32], nodata: Option<f32>) -> Result<Self> {
        let cells = values
            .iter()
            .map(|&v| match nodata {
                Some(nd) if v == nd => Cell::NoData,
                _ => Cell::from_f32(v),
            })
            .collect();
        Self::from_cells(grid, cells)
    }

    /// Float raster from cells already known to match `grid`.
    pub(crate) fn from_parts(grid: GridSpec, cells: Vec<Cell>) -> Raster {
        debug_assert_eq!(cells.len(), grid.len());
        Raster { grid, pixel_type: PixelType::Float32, cells }
    }

    /// New float raster on this raster's grid.
    pub(crate) fn derive(&self, cells: Vec<Cell>) -> Raster {
        Self::from_parts(self.grid, cells)
    }

    /// Re-tag the value domain. Switching to `Int32` truncates toward zero.
    pub fn with_pixel_type(mut self, pixel_type: PixelType) -> Self {
        if pixel_type == PixelType::Int32 {
            for cell in &mut self.cells {
                if let Cell::Valid(v) = *cell {
                    *cell = Cell::Valid(v.trunc());
                }
            }
        }
        self.pixel_type = pixel_type;
        self
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Cell {
        self.cells[self.grid.index(row, col)]
    }

    pub fn valid_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_valid()).count()
    }

    pub fn valid_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.cells.iter().filter_map(|c| c.value())
    }

    /// Sum of all valid cells (f64 accumulator).
    pub fn sum(&self) -> f64 {
        self.valid_values().map(f64::from).sum()
    }

    /// Flatten to raw samples with `nodata` written for missing cells.
    pub fn to_values(&self, nodata: f32) -> Vec<f32> {
        self.cells.iter().map(|c| c.value().unwrap_or(nodata)).collect()
    }
}
