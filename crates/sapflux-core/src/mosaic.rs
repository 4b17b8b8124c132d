//! Mosaic overlapping rasters onto one grid.
use serde::{Deserialize, Serialize};

use crate::error::{Result, SapfluxError};
use crate::raster::{Cell, GridSpec, PixelType, Raster};

/// How cells covered by more than one input are resolved.
///
/// `Mean`, `Minimum`, `Maximum` and `Sum` are insensitive to input order;
/// `First` and `Last` are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MosaicMethod {
    #[default]
    Mean,
    Minimum,
    Maximum,
    Sum,
    First,
    Last,
}

#[derive(Clone, Copy)]
struct Accum {
    value: f64,
    count: u32,
}

impl MosaicMethod {
    #[inline]
    fn fold(self, acc: &mut Accum, v: f64) {
        acc.value = if acc.count == 0 {
            v
        } else {
            match self {
                MosaicMethod::Mean | MosaicMethod::Sum => acc.value + v,
                MosaicMethod::Minimum => acc.value.min(v),
                MosaicMethod::Maximum => acc.value.max(v),
                MosaicMethod::First => acc.value,
                MosaicMethod::Last => v,
            }
        };
        acc.count += 1;
    }

    #[inline]
    fn finish(self, acc: Accum) -> Cell {
        match (acc.count, self) {
            (0, _) => Cell::NoData,
            (n, MosaicMethod::Mean) => Cell::from_f64(acc.value / f64::from(n)),
            _ => Cell::from_f64(acc.value),
        }
    }
}

/// `grid`'s extent expressed exactly on `reference`'s lattice.
fn snap_to_lattice(grid: &GridSpec, reference: &GridSpec) -> Result<GridSpec> {
    let (c, r) = grid.lattice_offset(reference)?;
    Ok(GridSpec {
        cols: grid.cols,
        rows: grid.rows,
        cell_size: reference.cell_size,
        x_min: reference.x_min + c as f64 * reference.cell_size,
        y_max: reference.y_max - r as f64 * reference.cell_size,
    })
}

/// Combine `inputs` into one raster covering the union of their extents.
///
/// The output lies on `reference`'s lattice and takes its pixel type; every
/// input must share that cell size and lattice. Where only one input has
/// data it passes through; where none has data the output is NoData.
pub fn mosaic(inputs: &[&Raster], reference: &Raster, method: MosaicMethod) -> Result<Raster> {
    if inputs.is_empty() {
        return Err(SapfluxError::EmptyInput("mosaic needs at least one input".into()));
    }
    // The reference fixes the lattice; the extent comes from the inputs.
    let mut grid = snap_to_lattice(inputs[0].grid(), reference.grid())?;
    for r in &inputs[1..] {
        grid = grid.union(r.grid())?;
    }

    let mut acc = vec![Accum { value: 0.0, count: 0 }; grid.len()];
    for r in inputs {
        let (dc, dr) = r.grid().lattice_offset(&grid)?;
        let src = r.grid();
        for row in 0..src.rows {
            let out_row = (row as isize + dr) as usize;
            for col in 0..src.cols {
                if let Cell::Valid(v) = r.get(row, col) {
                    let out_col = (col as isize + dc) as usize;
                    method.fold(&mut acc[grid.index(out_row, out_col)], f64::from(v));
                }
            }
        }
    }

    let cells = acc.into_iter().map(|a| method.finish(a)).collect();
    let out = Raster::from_cells(grid, cells)?;
    Ok(match reference.pixel_type() {
        PixelType::Int32 => out.with_pixel_type(PixelType::Int32),
        PixelType::Float32 => out,
    })
}
