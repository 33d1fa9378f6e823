/// Discovery job configuration
/// Sizing knobs for the external-memory pipeline plus the semantic modes
/// (duplicate and null handling) consumed by the lattice.

use crate::error::{SpindError, SpindResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether repeated values count once per occurrence or once per distinct value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateHandling {
    /// Violation budgets and violations are measured in occurrences
    Aware,
    /// Violation budgets and violations are measured in distinct values
    Unaware,
}

/// How null cells take part in inclusion checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullHandling {
    /// Nulls are ignored on both sides
    Subset,
    /// A referenced side may not contain nulls at all
    Foreign,
    /// Null is an ordinary value equal to every other null
    Equality,
    /// Every dependent null is a violation
    Inequality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Minimum fraction of dependent occurrences that must be included
    pub threshold: f64,

    /// Maximum combination size; zero or negative means unbounded
    pub max_arity: i32,

    /// Rows per horizontal chunk file
    pub chunk_size: usize,

    /// Distinct (value, attribute) pairs held by all aggregators together
    pub sort_memory_budget: usize,

    /// Entries seen fewer times than this survive a partial spill in memory
    pub keep_threshold: u64,

    /// Maximum number of runs merged at once
    pub merge_fan_in: usize,

    /// Look-ahead entries buffered per validation reader
    pub validation_window_size: usize,

    pub duplicate_handling: DuplicateHandling,

    pub null_handling: NullHandling,

    /// Skip values proven unique in earlier layers
    pub use_filter: bool,

    /// Rebuild the filter from every layer instead of keeping the unary one
    pub refine_filter: bool,

    /// Expected number of distinct values inserted into the filter
    pub filter_expected_values: usize,

    /// Label stored after the null marker when null handling is `Equality`;
    /// nulls never equal a real cell whatever the label
    pub null_token: String,

    /// Worker threads for aggregation and merging
    pub parallelism: usize,

    /// Scratch directory for chunk, run and relation files
    pub temp_dir: PathBuf,

    /// Directory for reports; `None` disables file output
    pub result_dir: Option<PathBuf>,

    /// Name used for the metrics summary file
    pub execution_name: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            max_arity: -1,
            chunk_size: 1_000_000,
            sort_memory_budget: 10_000_000,
            keep_threshold: 2,
            merge_fan_in: 64,
            validation_window_size: 100_000,
            duplicate_handling: DuplicateHandling::Aware,
            null_handling: NullHandling::Subset,
            use_filter: true,
            refine_filter: true,
            filter_expected_values: 10_000_000,
            null_token: String::new(),
            parallelism: num_cpus::get(),
            temp_dir: std::env::temp_dir().join("spind"),
            result_dir: None,
            execution_name: "SPIND".to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Load a configuration from a JSON file; absent fields keep their defaults
    pub fn from_json_file(path: &Path) -> SpindResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SpindError::io_with_path("Failed to read config file", path, &e))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SpindError::config(format!("Invalid config file: {}", e), "file"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings before any relation is initialized
    pub fn validate(&self) -> SpindResult<()> {
        if !(0.0..=1.0).contains(&self.threshold) || self.threshold.is_nan() {
            return Err(SpindError::config(
                format!("threshold must lie in [0, 1], got {}", self.threshold),
                "threshold",
            ));
        }
        let positive = [
            ("chunk_size", self.chunk_size),
            ("sort_memory_budget", self.sort_memory_budget),
            ("validation_window_size", self.validation_window_size),
            ("parallelism", self.parallelism),
            ("filter_expected_values", self.filter_expected_values),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(SpindError::config(format!("{} must be positive", field), field));
            }
        }
        if self.merge_fan_in < 2 {
            return Err(SpindError::config("merge_fan_in must be at least 2", "merge_fan_in"));
        }
        if self.refine_filter && !self.use_filter {
            return Err(SpindError::config(
                "refine_filter requires use_filter",
                "refine_filter",
            ));
        }
        Ok(())
    }

    /// Whether layer `layer` is the last one that should be processed
    pub fn is_last_layer(&self, layer: usize) -> bool {
        self.max_arity > 0 && layer >= self.max_arity as usize
    }

    /// Budget of one aggregation job (the global budget is shared by the pool)
    pub fn sort_budget_per_job(&self) -> usize {
        (self.sort_memory_budget / self.parallelism).max(1)
    }

    /// Filter consultation only preserves exact results when violations are
    /// counted per occurrence
    pub fn skips_unique_values(&self) -> bool {
        self.use_filter && self.duplicate_handling == DuplicateHandling::Aware
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DiscoveryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let config = DiscoveryConfig {
            threshold: 1.5,
            ..Default::default()
        };
        match config.validate() {
            Err(SpindError::Config { field, .. }) => assert_eq!(field.as_deref(), Some("threshold")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_small_fan_in_and_zero_budget() {
        let config = DiscoveryConfig {
            merge_fan_in: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            sort_memory_budget: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refine_requires_filter() {
        let config = DiscoveryConfig {
            use_filter: false,
            refine_filter: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"threshold": 0.9, "null_handling": "foreign"}"#).unwrap();
        assert_eq!(config.threshold, 0.9);
        assert_eq!(config.null_handling, NullHandling::Foreign);
        assert_eq!(config.merge_fan_in, 64);
    }

    #[test]
    fn test_max_arity_bounds_layers() {
        let unbounded = DiscoveryConfig::default();
        assert!(!unbounded.is_last_layer(10));

        let bounded = DiscoveryConfig {
            max_arity: 2,
            ..Default::default()
        };
        assert!(!bounded.is_last_layer(1));
        assert!(bounded.is_last_layer(2));
    }
}
