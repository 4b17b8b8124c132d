//! Share of one species in the total cover of every species layer.
use serde::Serialize;
use tracing::{info, warn};

use crate::algebra;
use crate::chunked::{BatchId, ChunkedReducer};
use crate::config::PercentCoverConfig;
use crate::context::ExecutionContext;
use crate::error::{Result, SapfluxError};
use crate::raster::Raster;
use crate::stats::{compute_stats, RasterStats};

/// Sum of all species layers, ignoring NoData per cell.
pub fn total_cover(layers: &[Raster], reducer: &ChunkedReducer) -> Result<Raster> {
    reducer.reduce(layers)
}

/// `target / total * scale`. Cells where the total is zero or NoData are NoData.
pub fn percent_of_total(target: &Raster, total: &Raster, scale: f64) -> Result<Raster> {
    let share = algebra::divide(target, total)?;
    algebra::multiply(&share, scale)
}

#[derive(Debug, Clone, Serialize)]
pub struct PercentCoverReport {
    pub layers: usize,
    pub batches: usize,
    pub total_output: String,
    pub percent_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_stats: Option<RasterStats>,
}

fn chunk_name(id: BatchId) -> String {
    format!("cellstat{}", id.ordinal)
}

/// Reduce every input layer into a total, then the target's percent of it.
///
/// Layers load lazily, one batch at a time. With `persist_chunks` each batch
/// result is saved to the scratch store and removed once the run finishes.
pub fn run_percent_cover(ctx: &ExecutionContext, config: &PercentCoverConfig) -> Result<PercentCoverReport> {
    let layers: Vec<String> = ctx
        .inputs
        .list_rasters()?
        .into_iter()
        .filter(|n| *n != config.total_output && *n != config.percent_output)
        .collect();
    if !layers.iter().any(|n| *n == config.target_dataset) {
        return Err(SapfluxError::MissingDataset(config.target_dataset.clone()));
    }
    info!(layers = layers.len(), batch_size = config.chunk_batch_size, "summing species cover");

    let reducer = ChunkedReducer::new(config.chunk_batch_size)?;
    let mut persisted = Vec::new();
    let mut batches = 0usize;
    let reduced = reducer.reduce_sources(
        &layers,
        |name| ctx.inputs.read_raster(name),
        |id, raster| {
            batches += 1;
            if config.persist_chunks {
                let name = chunk_name(id);
                ctx.scratch.write_raster(&name, raster)?;
                persisted.push(name);
            }
            Ok(())
        },
    );

    for name in &persisted {
        if let Err(e) = ctx.scratch.delete_raster(name) {
            warn!(chunk = %name, error = %e, "could not remove chunk result");
        }
    }
    let total = reduced?;
    ctx.outputs.write_raster(&config.total_output, &total)?;

    let target = ctx.inputs.read_raster(&config.target_dataset)?;
    let percent = percent_of_total(&target, &total, config.percent_scale)?;
    ctx.outputs.write_raster(&config.percent_output, &percent)?;

    let percent_stats = compute_stats(&percent);
    if let Some(s) = &percent_stats {
        info!(mean = s.mean, max = s.max, cells = s.count, "percent cover");
    }
    Ok(PercentCoverReport {
        layers: layers.len(),
        batches,
        total_output: config.total_output.clone(),
        percent_output: config.percent_output.clone(),
        percent_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Cell, GridSpec};
    use crate::storage::{MemoryStore, RasterStore};
    use approx::assert_relative_eq;

    fn raster(vals: &[Option<f32>]) -> Raster {
        Raster::from_cells(
            GridSpec::new(vals.len(), 1, 250.0, 0.0, 250.0),
            vals.iter().map(|&v| Cell::from(v)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn percent_is_nodata_where_total_is_zero() {
        let target = raster(&[Some(1.0), Some(0.0), None]);
        let total = raster(&[Some(4.0), Some(0.0), Some(3.0)]);
        let p = percent_of_total(&target, &total, 100.0).unwrap();
        assert_eq!(p.cells(), &[Cell::Valid(25.0), Cell::NoData, Cell::NoData]);
    }

    #[test]
    fn total_cover_ignores_missing_species() {
        let layers = vec![
            raster(&[Some(1.0), None, None]),
            raster(&[Some(2.0), Some(5.0), None]),
            raster(&[None, Some(1.0), None]),
        ];
        let total = total_cover(&layers, &ChunkedReducer::new(2).unwrap()).unwrap();
        assert_eq!(total.cells(), &[Cell::Valid(3.0), Cell::Valid(6.0), Cell::NoData]);
    }

    fn species_store(n: usize) -> MemoryStore {
        let mut store = MemoryStore::new();
        for i in 0..n {
            let v = (i + 1) as f32;
            store = store.with_raster(&format!("s{:03}", i + 500), raster(&[Some(v), Some(1.0), None]));
        }
        store
    }

    #[test]
    fn run_sums_all_layers_and_cleans_chunks() {
        let store = species_store(120);
        let inputs = store.clone();
        let outputs = MemoryStore::new();
        let scratch = MemoryStore::new();
        let ctx = ExecutionContext::new(
            std::sync::Arc::new(inputs),
            std::sync::Arc::new(outputs.clone()),
            std::sync::Arc::new(outputs.clone()),
            std::sync::Arc::new(scratch.clone()),
        );
        let cfg = PercentCoverConfig {
            target_dataset: "s543".into(),
            persist_chunks: true,
            ..PercentCoverConfig::default()
        };
        let report = run_percent_cover(&ctx, &cfg).unwrap();
        assert_eq!(report.layers, 120);
        // Three level-0 batches of at most 50, then the root.
        assert_eq!(report.batches, 4);
        assert!(scratch.list_rasters().unwrap().is_empty());

        let total = outputs.read_raster("All_Species").unwrap();
        assert_relative_eq!(total.get(0, 0).value().unwrap(), (120.0 * 121.0 / 2.0) as f32);
        assert_eq!(total.get(0, 1), Cell::Valid(120.0));
        assert_eq!(total.get(0, 2), Cell::NoData);

        let percent = outputs.read_raster("Ash_Percent_kNN_250m_US").unwrap();
        assert_relative_eq!(percent.get(0, 0).value().unwrap(), 44.0 / 7260.0 * 100.0, max_relative = 1e-5);
        assert_relative_eq!(percent.get(0, 1).value().unwrap(), 100.0 / 120.0, max_relative = 1e-5);
    }

    #[test]
    fn previous_outputs_are_not_counted() {
        let store = species_store(3).with_raster("All_Species", raster(&[Some(1e6); 3]));
        let ctx = ExecutionContext::in_memory(&store);
        let cfg = PercentCoverConfig { target_dataset: "s500".into(), ..PercentCoverConfig::default() };
        let report = run_percent_cover(&ctx, &cfg).unwrap();
        assert_eq!(report.layers, 3);
        assert_eq!(store.read_raster("All_Species").unwrap().get(0, 0), Cell::Valid(6.0));
    }

    #[test]
    fn missing_target_is_an_error() {
        let ctx = ExecutionContext::in_memory(&species_store(2));
        let cfg = PercentCoverConfig { target_dataset: "s999".into(), ..PercentCoverConfig::default() };
        assert!(matches!(run_percent_cover(&ctx, &cfg), Err(SapfluxError::MissingDataset(_))));
    }

    #[test]
    fn misaligned_layer_fails_whole_run() {
        let store = species_store(3).with_raster(
            "s600",
            Raster::filled(GridSpec::new(3, 1, 250.0, 250.0, 250.0), Cell::Valid(1.0)),
        );
        let ctx = ExecutionContext::in_memory(&store);
        let cfg = PercentCoverConfig {
            target_dataset: "s500".into(),
            chunk_batch_size: 2,
            persist_chunks: true,
            ..PercentCoverConfig::default()
        };
        let err = run_percent_cover(&ctx, &cfg).unwrap_err();
        assert!(matches!(err, SapfluxError::PartialChunkFailure { level: 0, batch: 1, .. }));
        assert!(!store.contains("All_Species").unwrap());
        assert!(!store.contains("cellstat1").unwrap());
    }
}
