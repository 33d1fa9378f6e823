/// Run metrics collection
///
/// Counters are gathered per layer by the orchestrator and written once as a
/// JSON summary at the end of a successful run.
use crate::error::{SpindError, SpindResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Counters and stage timings of one layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetrics {
    pub layer: usize,
    pub attributes: usize,
    pub candidates: usize,
    pub pinds: usize,
    pub sort_files: usize,
    pub merge_files: usize,
    pub merge_waves: usize,
    pub spills: usize,
    pub value_groups: u64,
    pub filter_inserts: u64,
    /// Filter fill after validation; the estimated false-positive rate bounds
    /// how many unique values escaped skipping in the next layer
    pub filter_values: usize,
    pub filter_bits_set: usize,
    pub filter_false_positive_rate: f64,
    pub null_rows: u64,
    pub global_unique_skips: u64,
    pub aggregation_ms: u64,
    pub merge_ms: u64,
    pub validation_ms: u64,
    pub expansion_ms: u64,
}

/// Summary of a whole discovery run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub execution_name: String,
    pub threshold: f64,
    pub relations: usize,
    pub rows: u64,
    pub skipped_rows: u64,
    pub chunk_files: usize,
    pub chunking_ms: u64,
    pub layers: Vec<LayerMetrics>,
    pub total_pinds: usize,
    pub total_ms: u64,
}

impl RunMetrics {
    pub fn new(execution_name: impl Into<String>, threshold: f64) -> Self {
        Self {
            execution_name: execution_name.into(),
            threshold,
            ..Default::default()
        }
    }

    pub fn sort_files(&self) -> usize {
        self.layers.iter().map(|layer| layer.sort_files).sum()
    }

    pub fn merge_files(&self) -> usize {
        self.layers.iter().map(|layer| layer.merge_files).sum()
    }

    /// Write `<execution_name>_<unix-secs>.json` into `dir`
    pub fn write_json(&self, dir: &Path) -> SpindResult<PathBuf> {
        std::fs::create_dir_all(dir)
            .map_err(|e| SpindError::io_with_path("Failed to create result directory", dir, &e))?;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = dir.join(format!("{}_{}.json", self.execution_name, secs));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SpindError::io(format!("Failed to serialize run metrics: {}", e)))?;
        std::fs::write(&path, json)
            .map_err(|e| SpindError::io_with_path("Failed to write run metrics", &path, &e))?;
        Ok(path)
    }
}

/// Wall-clock timer of one stage
pub struct StageClock {
    started: Instant,
}

impl StageClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}
