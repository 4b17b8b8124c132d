//! Elementwise raster algebra.
//!
//! Every operator returns a new [`Raster`] computed cell-by-cell from
//! co-located inputs. All raster operands must share one grid. NoData in any
//! input yields NoData unless an operator states otherwise, and division by a
//! zero or NoData denominator yields NoData rather than ±inf.
use crate::error::{Result, SapfluxError};
use crate::raster::{Cell, GridSpec, PixelType, Raster};

/// A raster or a constant broadcast to every cell.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Raster(&'a Raster),
    Scalar(f64),
}

impl<'a> Operand<'a> {
    #[inline]
    fn cell(&self, idx: usize) -> Cell {
        match self {
            Operand::Raster(r) => r.cells()[idx],
            Operand::Scalar(v) => Cell::from_f64(*v),
        }
    }

    fn grid(&self) -> Option<&GridSpec> {
        match self {
            Operand::Raster(r) => Some(r.grid()),
            Operand::Scalar(_) => None,
        }
    }
}

impl<'a> From<&'a Raster> for Operand<'a> {
    fn from(r: &'a Raster) -> Self {
        Operand::Raster(r)
    }
}

impl From<f64> for Operand<'_> {
    fn from(v: f64) -> Self {
        Operand::Scalar(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    #[inline]
    fn apply(self, a: f64, b: f64) -> Cell {
        match self {
            BinaryOp::Add => Cell::from_f64(a + b),
            BinaryOp::Subtract => Cell::from_f64(a - b),
            BinaryOp::Multiply => Cell::from_f64(a * b),
            BinaryOp::Divide if b == 0.0 => Cell::NoData,
            BinaryOp::Divide => Cell::from_f64(a / b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
}

impl Comparison {
    #[inline]
    pub fn test(self, a: f64, b: f64) -> bool {
        match self {
            Comparison::Greater => a > b,
            Comparison::GreaterEqual => a >= b,
            Comparison::Less => a < b,
            Comparison::LessEqual => a <= b,
            Comparison::Equal => a == b,
            Comparison::NotEqual => a != b,
        }
    }
}

/// Grid shared by every raster operand. At least one operand must be a raster.
fn common_grid(operands: &[Operand<'_>]) -> Result<GridSpec> {
    let mut grids = operands.iter().filter_map(Operand::grid);
    let first = *grids
        .next()
        .ok_or_else(|| SapfluxError::EmptyInput("expression has no raster operand".into()))?;
    for g in grids {
        first.ensure_aligned(g)?;
    }
    Ok(first)
}

fn collect(grid: GridSpec, cells: Vec<Cell>) -> Result<Raster> {
    Raster::from_cells(grid, cells)
}

/// `a <op> b` with NoData propagation.
pub fn binary<'a>(a: impl Into<Operand<'a>>, op: BinaryOp, b: impl Into<Operand<'a>>) -> Result<Raster> {
    let (a, b) = (a.into(), b.into());
    let grid = common_grid(&[a, b])?;
    let cells = (0..grid.len())
        .map(|i| match (a.cell(i), b.cell(i)) {
            (Cell::Valid(x), Cell::Valid(y)) => op.apply(f64::from(x), f64::from(y)),
            _ => Cell::NoData,
        })
        .collect();
    collect(grid, cells)
}

pub fn add<'a>(a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<Raster> {
    binary(a, BinaryOp::Add, b)
}

pub fn subtract<'a>(a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<Raster> {
    binary(a, BinaryOp::Subtract, b)
}

pub fn multiply<'a>(a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<Raster> {
    binary(a, BinaryOp::Multiply, b)
}

pub fn divide<'a>(a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<Raster> {
    binary(a, BinaryOp::Divide, b)
}

/// Boolean raster (1 / 0, integer-typed) of `a <cmp> b`. NoData propagates.
pub fn compare<'a>(a: impl Into<Operand<'a>>, cmp: Comparison, b: impl Into<Operand<'a>>) -> Result<Raster> {
    let (a, b) = (a.into(), b.into());
    let grid = common_grid(&[a, b])?;
    let cells = (0..grid.len())
        .map(|i| match (a.cell(i), b.cell(i)) {
            (Cell::Valid(x), Cell::Valid(y)) => {
                Cell::Valid(if cmp.test(f64::from(x), f64::from(y)) { 1.0 } else { 0.0 })
            }
            _ => Cell::NoData,
        })
        .collect();
    Ok(collect(grid, cells)?.with_pixel_type(PixelType::Int32))
}

/// Conditional select.
///
/// For each cell of `condition`: NoData stays NoData; otherwise the output is
/// `when_true` where `predicate(value)` holds and `when_false` elsewhere.
pub fn con<'a>(
    condition: &Raster,
    predicate: impl Fn(f32) -> bool,
    when_true: impl Into<Operand<'a>>,
    when_false: impl Into<Operand<'a>>,
) -> Result<Raster> {
    let (t, f) = (when_true.into(), when_false.into());
    let grid = common_grid(&[Operand::Raster(condition), t, f])?;
    let cells = condition
        .cells()
        .iter()
        .enumerate()
        .map(|(i, c)| match c {
            Cell::Valid(v) if predicate(*v) => t.cell(i),
            Cell::Valid(_) => f.cell(i),
            Cell::NoData => Cell::NoData,
        })
        .collect();
    collect(grid, cells)
}

/// Cells whose value satisfies `predicate` become NoData; others pass through.
pub fn set_null(raster: &Raster, predicate: impl Fn(f32) -> bool) -> Raster {
    let cells = raster
        .cells()
        .iter()
        .map(|&c| match c {
            Cell::Valid(v) if predicate(v) => Cell::NoData,
            other => other,
        })
        .collect();
    raster.derive(cells).with_pixel_type(raster.pixel_type())
}

/// Apply `f` to every valid cell; NoData propagates and non-finite results become NoData.
pub fn map(raster: &Raster, f: impl Fn(f64) -> f64) -> Raster {
    let cells = raster
        .cells()
        .iter()
        .map(|c| match c {
            Cell::Valid(v) => Cell::from_f64(f(f64::from(*v))),
            Cell::NoData => Cell::NoData,
        })
        .collect();
    raster.derive(cells)
}

/// Integer raster by truncation toward zero.
pub fn truncate_to_int(raster: &Raster) -> Raster {
    raster.clone().with_pixel_type(PixelType::Int32)
}

/// Keep cells of `raster` whose location holds valid data in `mask`.
///
/// The mask may cover a different extent but must share the lattice; cells
/// outside the mask extent become NoData. The output keeps `raster`'s grid.
pub fn extract_by_mask(raster: &Raster, mask: &Raster) -> Result<Raster> {
    let grid = *raster.grid();
    let mgrid = *mask.grid();
    let (dc, dr) = grid.lattice_offset(&mgrid)?;
    let mut cells = Vec::with_capacity(grid.len());
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let mr = row as isize + dr;
            let mc = col as isize + dc;
            let inside = mr >= 0 && mc >= 0 && (mr as usize) < mgrid.rows && (mc as usize) < mgrid.cols;
            let keep = inside && mask.get(mr as usize, mc as usize).is_valid();
            cells.push(if keep { raster.get(row, col) } else { Cell::NoData });
        }
    }
    Ok(collect(grid, cells)?.with_pixel_type(raster.pixel_type()))
}
