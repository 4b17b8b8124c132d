//! Cell statistics across raster stacks and the bounded-arity chunked reducer.
//!
//! `cell_statistics` combines a stack of aligned rasters cell-by-cell.
//! `ChunkedReducer` applies it to arbitrarily many layers by partitioning the
//! stack into batches of at most `batch_size`, reducing each batch, then
//! reducing the batch results level by level until one raster remains.
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(feature = "threading")]
use rayon::prelude::*;

use crate::error::{Result, SapfluxError};
use crate::raster::{Cell, Raster};

/// Batch size used when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// How NoData inputs affect a multi-layer statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoDataPolicy {
    /// NoData in any layer makes the output cell NoData.
    Propagate,
    /// Missing layers are skipped; the cell is NoData only if every layer is.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Sum,
    Minimum,
    Maximum,
    Mean,
}

impl Statistic {
    /// Whether partial results can be combined with the same statistic.
    pub fn is_associative(self) -> bool {
        !matches!(self, Statistic::Mean)
    }
}

/// Split `0..len` into contiguous ranges of at most `batch_size`.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let step = batch_size.max(1);
    (0..len)
        .step_by(step)
        .map(|start| start..(start + step).min(len))
        .collect()
}

/// Combine aligned rasters cell-by-cell.
pub fn cell_statistics(layers: &[&Raster], statistic: Statistic, policy: NoDataPolicy) -> Result<Raster> {
    let first = layers
        .first()
        .ok_or_else(|| SapfluxError::EmptyInput("cell statistics need at least one layer".into()))?;
    let grid = *first.grid();
    for layer in &layers[1..] {
        grid.ensure_aligned(layer.grid())?;
    }

    let n = grid.len();
    let mut acc = vec![0.0f64; n];
    let mut count = vec![0u32; n];
    let mut poisoned = vec![false; n];

    for layer in layers {
        for (i, cell) in layer.cells().iter().enumerate() {
            match *cell {
                Cell::Valid(v) => {
                    let v = f64::from(v);
                    acc[i] = if count[i] == 0 {
                        v
                    } else {
                        match statistic {
                            Statistic::Sum | Statistic::Mean => acc[i] + v,
                            Statistic::Minimum => acc[i].min(v),
                            Statistic::Maximum => acc[i].max(v),
                        }
                    };
                    count[i] += 1;
                }
                Cell::NoData => {
                    if policy == NoDataPolicy::Propagate {
                        poisoned[i] = true;
                    }
                }
            }
        }
    }

    let cells = (0..n)
        .map(|i| {
            if poisoned[i] || count[i] == 0 {
                Cell::NoData
            } else if statistic == Statistic::Mean {
                Cell::from_f64(acc[i] / f64::from(count[i]))
            } else {
                Cell::from_f64(acc[i])
            }
        })
        .collect();
    Raster::from_cells(grid, cells)
}

/// Position of one batch in the reduction tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchId {
    /// 0 for batches of input layers, increasing toward the root.
    pub level: usize,
    pub index: usize,
    /// 1-based ordinal across the whole run, used for naming persisted chunks.
    pub ordinal: usize,
}

/// Reduces many aligned rasters with a bounded number of inputs per operation.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedReducer {
    batch_size: usize,
    statistic: Statistic,
    policy: NoDataPolicy,
}

impl Default for ChunkedReducer {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            statistic: Statistic::Sum,
            policy: NoDataPolicy::Ignore,
        }
    }
}

impl ChunkedReducer {
    /// Sum reducer with the "ignore missing" policy.
    pub fn new(batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(SapfluxError::config("chunk batch size must be at least 1"));
        }
        Ok(Self { batch_size, ..Self::default() })
    }

    pub fn with_statistic(mut self, statistic: Statistic) -> Result<Self> {
        if !statistic.is_associative() {
            return Err(SapfluxError::config(format!(
                "{statistic:?} cannot be reduced in chunks"
            )));
        }
        self.statistic = statistic;
        Ok(self)
    }

    pub fn with_policy(mut self, policy: NoDataPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fan-in above the first level. A batch size of 1 cannot shrink a level,
    /// so intermediate levels combine at least two results.
    fn tree_fan_in(&self) -> usize {
        self.batch_size.max(2)
    }

    /// Reduce rasters already in memory.
    pub fn reduce(&self, layers: &[Raster]) -> Result<Raster> {
        self.reduce_batches(
            layers.len(),
            |range| {
                let refs: Vec<&Raster> = layers[range.clone()].iter().collect();
                cell_statistics(&refs, self.statistic, self.policy)
            },
            |_, _| Ok(()),
        )
    }

    /// Reduce `sources`, loading each layer only while its batch is computed.
    ///
    /// `on_batch` sees every intermediate result in tree order; returning an
    /// error aborts the reduction. Any failure inside a batch fails the whole
    /// reduction with [`SapfluxError::PartialChunkFailure`].
    pub fn reduce_sources<S, L, F>(&self, sources: &[S], load: L, on_batch: F) -> Result<Raster>
    where
        S: Sync,
        L: Fn(&S) -> Result<Raster> + Sync,
        F: FnMut(BatchId, &Raster) -> Result<()>,
    {
        self.reduce_batches(
            sources.len(),
            |range| {
                let loaded = sources[range.clone()].iter().map(&load).collect::<Result<Vec<_>>>()?;
                let refs: Vec<&Raster> = loaded.iter().collect();
                cell_statistics(&refs, self.statistic, self.policy)
            },
            on_batch,
        )
    }

    /// Run the reduction tree over `len` inputs; `first_level` reduces one
    /// range of inputs.
    fn reduce_batches<B, F>(&self, len: usize, first_level: B, mut on_batch: F) -> Result<Raster>
    where
        B: Fn(&Range<usize>) -> Result<Raster> + Sync,
        F: FnMut(BatchId, &Raster) -> Result<()>,
    {
        if len == 0 {
            return Err(SapfluxError::EmptyInput("no layers to reduce".into()));
        }
        let mut ordinal = 0usize;

        let ranges = partition(len, self.batch_size);
        info!(
            layers = len,
            batches = ranges.len(),
            batch_size = self.batch_size,
            "reducing layers in batches"
        );
        let mut current = self.run_level(0, &ranges, first_level)?;
        self.report(0, &current, &mut ordinal, &mut on_batch)?;

        let mut level = 0;
        while current.len() > 1 {
            level += 1;
            let ranges = partition(current.len(), self.tree_fan_in());
            debug!(level, inputs = current.len(), batches = ranges.len(), "reduction level");
            let previous = current;
            current = self.run_level(level, &ranges, |range| {
                let refs: Vec<&Raster> = previous[range.clone()].iter().collect();
                cell_statistics(&refs, self.statistic, self.policy)
            })?;
            self.report(level, &current, &mut ordinal, &mut on_batch)?;
        }

        current
            .pop()
            .ok_or_else(|| SapfluxError::EmptyInput("reduction produced no result".into()))
    }

    fn run_level<B>(&self, level: usize, ranges: &[Range<usize>], batch: B) -> Result<Vec<Raster>>
    where
        B: Fn(&Range<usize>) -> Result<Raster> + Sync,
    {
        #[cfg(feature = "threading")]
        let results: Vec<Result<Raster>> = ranges.par_iter().map(&batch).collect();
        #[cfg(not(feature = "threading"))]
        let results: Vec<Result<Raster>> = ranges.iter().map(&batch).collect();

        results
            .into_iter()
            .enumerate()
            .map(|(index, r)| {
                r.map_err(|e| SapfluxError::PartialChunkFailure {
                    level,
                    batch: index,
                    source: Box::new(e),
                })
            })
            .collect()
    }

    fn report<F>(&self, level: usize, results: &[Raster], ordinal: &mut usize, on_batch: &mut F) -> Result<()>
    where
        F: FnMut(BatchId, &Raster) -> Result<()>,
    {
        for (index, raster) in results.iter().enumerate() {
            *ordinal += 1;
            on_batch(BatchId { level, index, ordinal: *ordinal }, raster)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GridSpec;
    use approx::assert_relative_eq;

    fn grid() -> GridSpec {
        GridSpec::new(4, 2, 250.0, 0.0, 500.0)
    }

    /// Deterministic stack: layer k has value k+1 in cell (k mod 8), a
    /// fractional value in every other cell, and NoData in one cell.
    fn stack(n: usize) -> Vec<Raster> {
        (0..n)
            .map(|k| {
                let cells = (0..8)
                    .map(|i| {
                        if i == 7 {
                            Cell::NoData
                        } else if i == k % 8 {
                            Cell::Valid((k + 1) as f32)
                        } else {
                            Cell::Valid(0.25 * ((k * 7 + i * 3) % 5) as f32)
                        }
                    })
                    .collect();
                Raster::from_cells(grid(), cells).unwrap()
            })
            .collect()
    }

    fn unbounded_sum(layers: &[Raster]) -> Raster {
        let refs: Vec<&Raster> = layers.iter().collect();
        cell_statistics(&refs, Statistic::Sum, NoDataPolicy::Ignore).unwrap()
    }

    #[test]
    fn partition_covers_input_in_order() {
        let p = partition(120, 50);
        assert_eq!(p, vec![0..50, 50..100, 100..120]);
        assert!(partition(0, 50).is_empty());
        assert_eq!(partition(3, 1), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn total_is_independent_of_batch_size() {
        let layers = stack(137);
        let expected = unbounded_sum(&layers);
        for batch_size in [1, 7, 50, layers.len()] {
            let total = ChunkedReducer::new(batch_size).unwrap().reduce(&layers).unwrap();
            for (a, b) in total.cells().iter().zip(expected.cells()) {
                match (a, b) {
                    (Cell::Valid(x), Cell::Valid(y)) => assert_relative_eq!(*x, *y, epsilon = 1e-3),
                    (Cell::NoData, Cell::NoData) => {}
                    other => panic!("batch size {batch_size}: mismatch {other:?}"),
                }
            }
        }
    }

    #[test]
    fn total_is_independent_of_order() {
        let mut layers = stack(60);
        let forward = ChunkedReducer::new(7).unwrap().reduce(&layers).unwrap();
        layers.reverse();
        let backward = ChunkedReducer::new(7).unwrap().reduce(&layers).unwrap();
        for (a, b) in forward.valid_values().zip(backward.valid_values()) {
            assert_relative_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn cell_missing_everywhere_stays_nodata() {
        let total = ChunkedReducer::new(5).unwrap().reduce(&stack(23)).unwrap();
        assert_eq!(total.cells()[7], Cell::NoData);
        assert!(total.cells()[..7].iter().all(|c| c.is_valid()));
    }

    #[test]
    fn partial_nodata_only_drops_missing_contribution() {
        let g = GridSpec::new(2, 1, 250.0, 0.0, 250.0);
        let a = Raster::from_cells(g, vec![Cell::Valid(2.0), Cell::NoData]).unwrap();
        let b = Raster::from_cells(g, vec![Cell::NoData, Cell::Valid(3.0)]).unwrap();
        let c = Raster::from_cells(g, vec![Cell::Valid(5.0), Cell::Valid(1.0)]).unwrap();
        let total = ChunkedReducer::new(2).unwrap().reduce(&[a, b, c]).unwrap();
        assert_eq!(total.cells(), &[Cell::Valid(7.0), Cell::Valid(4.0)]);
    }

    #[test]
    fn propagate_policy_poisons_cell() {
        let g = GridSpec::new(2, 1, 250.0, 0.0, 250.0);
        let a = Raster::from_cells(g, vec![Cell::Valid(2.0), Cell::NoData]).unwrap();
        let b = Raster::from_cells(g, vec![Cell::Valid(1.0), Cell::Valid(3.0)]).unwrap();
        let out = cell_statistics(&[&a, &b], Statistic::Sum, NoDataPolicy::Propagate).unwrap();
        assert_eq!(out.cells(), &[Cell::Valid(3.0), Cell::NoData]);
    }

    #[test]
    fn propagate_policy_holds_across_levels() {
        let g = GridSpec::new(2, 1, 250.0, 0.0, 250.0);
        let mut layers = vec![Raster::filled(g, Cell::Valid(1.0)); 6];
        layers[4] = Raster::from_cells(g, vec![Cell::Valid(1.0), Cell::NoData]).unwrap();

        let reducer = ChunkedReducer::new(2).unwrap();
        let ignored = reducer.reduce(&layers).unwrap();
        assert_eq!(ignored.cells(), &[Cell::Valid(6.0), Cell::Valid(5.0)]);

        let propagated = reducer.with_policy(NoDataPolicy::Propagate).reduce(&layers).unwrap();
        assert_eq!(propagated.cells(), &[Cell::Valid(6.0), Cell::NoData]);
    }

    #[test]
    fn mean_and_extremes() {
        let g = GridSpec::new(1, 1, 250.0, 0.0, 250.0);
        let layers: Vec<Raster> = [2.0, 8.0, 5.0]
            .iter()
            .map(|&v| Raster::filled(g, Cell::Valid(v)))
            .collect();
        let refs: Vec<&Raster> = layers.iter().collect();
        let mean = cell_statistics(&refs, Statistic::Mean, NoDataPolicy::Ignore).unwrap();
        let min = cell_statistics(&refs, Statistic::Minimum, NoDataPolicy::Ignore).unwrap();
        let max = cell_statistics(&refs, Statistic::Maximum, NoDataPolicy::Ignore).unwrap();
        assert_eq!(mean.cells(), &[Cell::Valid(5.0)]);
        assert_eq!(min.cells(), &[Cell::Valid(2.0)]);
        assert_eq!(max.cells(), &[Cell::Valid(8.0)]);

        let chunked_max = ChunkedReducer::new(2)
            .unwrap()
            .with_statistic(Statistic::Maximum)
            .unwrap()
            .reduce(&layers)
            .unwrap();
        assert_eq!(chunked_max.cells(), &[Cell::Valid(8.0)]);
    }

    #[test]
    fn mean_cannot_be_chunked() {
        let err = ChunkedReducer::new(2).unwrap().with_statistic(Statistic::Mean).unwrap_err();
        assert!(matches!(err, SapfluxError::Configuration(_)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(ChunkedReducer::new(0), Err(SapfluxError::Configuration(_))));
    }

    #[test]
    fn misaligned_layer_fails_whole_reduction() {
        let mut layers = stack(12);
        layers[9] = Raster::filled(GridSpec::new(4, 2, 250.0, 250.0, 500.0), Cell::Valid(1.0));
        let err = ChunkedReducer::new(5).unwrap().reduce(&layers).unwrap_err();
        match err {
            SapfluxError::PartialChunkFailure { level, batch, source } => {
                assert_eq!((level, batch), (0, 1));
                assert!(matches!(*source, SapfluxError::Alignment(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn on_batch_sees_every_intermediate_result() {
        let layers = stack(11);
        let mut seen = Vec::new();
        ChunkedReducer::new(5)
            .unwrap()
            .reduce_sources(&layers, |r| Ok(r.clone()), |id, _| {
                seen.push((id.level, id.index, id.ordinal));
                Ok(())
            })
            .unwrap();
        // 11 layers -> 3 batches at level 0 -> 1 result at level 1.
        assert_eq!(seen, vec![(0, 0, 1), (0, 1, 2), (0, 2, 3), (1, 0, 4)]);
    }

    #[test]
    fn empty_input_is_an_error() {
        let err = ChunkedReducer::default().reduce(&[]).unwrap_err();
        assert!(matches!(err, SapfluxError::EmptyInput(_)));
    }
}
