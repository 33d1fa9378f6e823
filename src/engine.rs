/// Discovery orchestrator
///
/// Drives the per-layer pipeline: aggregate every chunk into sorted runs,
/// merge the runs into one sorted file per relation, validate all candidates
/// in one streaming pass, report survivors and expand to the next arity.
use crate::config::DiscoveryConfig;
use crate::error::{SpindError, SpindResult};
use crate::execution::{BloomFilter, LayerMetrics, RunMetrics, SharedFilter, StageClock, Validator};
use crate::ingestion::{CsvOptions, CsvRowSource, RowSource};
use crate::lattice::Lattice;
use crate::metadata::{AttributeId, AttributeMetadata, Relation, RelationId};
use crate::result_format::{CollectingSink, DiscoveredPind, PindSink};
use crate::spill::{AggregationOutput, AggregationTarget, Aggregator, MergeScheduler};
use fxhash::FxHashMap;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A named relation handed to the engine
pub struct RelationInput {
    pub name: String,
    pub source: Box<dyn RowSource>,
}

impl RelationInput {
    pub fn new(name: impl Into<String>, source: impl RowSource + 'static) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
        }
    }

    pub fn csv(name: impl Into<String>, path: &Path, options: &CsvOptions) -> SpindResult<Self> {
        Ok(Self::new(name, CsvRowSource::open(path, options)?))
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub metrics: RunMetrics,
    /// Metrics summary, when a result directory is configured
    pub metrics_file: Option<PathBuf>,
    pub pind_count: usize,
}

pub struct SpindEngine {
    config: DiscoveryConfig,
    pool: ThreadPool,
}

impl SpindEngine {
    /// Validate the configuration and start the worker pool
    pub fn new(config: DiscoveryConfig) -> SpindResult<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.parallelism)
            .thread_name(|i| format!("spind-worker-{}", i))
            .build()
            .map_err(|e| SpindError::config(format!("Failed to start worker pool: {}", e), "parallelism"))?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run discovery and collect every pIND in memory
    pub fn discover(&self, inputs: Vec<RelationInput>) -> SpindResult<Vec<DiscoveredPind>> {
        let mut sink = CollectingSink::new();
        self.run(inputs, &mut sink)?;
        Ok(sink.into_pinds())
    }

    /// Run discovery over `inputs`, reporting each finished layer to `sink`.
    ///
    /// Temporary files live in a fresh directory under `temp_dir`; it is
    /// removed on success and left in place for inspection on failure.
    pub fn run(&self, inputs: Vec<RelationInput>, sink: &mut dyn PindSink) -> SpindResult<DiscoveryReport> {
        let run_clock = StageClock::start();
        let config = &self.config;
        let mut metrics = RunMetrics::new(&config.execution_name, config.threshold);
        let work_dir = self.create_work_dir()?;

        info!(
            execution = %config.execution_name,
            relations = inputs.len(),
            threshold = config.threshold,
            work_dir = %work_dir.display(),
            "Starting pIND discovery"
        );

        let clock = StageClock::start();
        let relations = self.chunk_relations(inputs, &work_dir)?;
        metrics.chunking_ms = clock.elapsed_ms();
        metrics.relations = relations.len();
        metrics.rows = relations.iter().map(|r| r.row_count).sum();
        metrics.skipped_rows = relations.iter().map(|r| r.skipped_rows).sum();
        metrics.chunk_files = relations.iter().map(|r| r.chunks.len()).sum();

        let mut lattice = Lattice::new(config);
        lattice.load_unary(&relations);
        let filter: Option<SharedFilter> = config
            .use_filter
            .then(|| BloomFilter::shared(config.filter_expected_values));

        while !lattice.attributes().is_empty() {
            let layer = lattice.layer();
            let scope = format!("layer {}", layer);
            let mut layer_metrics = LayerMetrics {
                layer,
                attributes: lattice.attributes().len(),
                candidates: lattice.candidate_count(),
                ..Default::default()
            };
            info!(
                layer,
                relations = lattice.relations_in_use().len(),
                attributes = layer_metrics.attributes,
                candidates = layer_metrics.candidates,
                "Processing layer"
            );

            let clock = StageClock::start();
            let pending = self.aggregate_layer(&relations, &mut lattice, filter.as_ref(), &work_dir, &mut layer_metrics)?;
            layer_metrics.aggregation_ms = clock.elapsed_ms();

            let clock = StageClock::start();
            let summary = MergeScheduler::new(&self.pool, config.merge_fan_in, &work_dir, layer)
                .merge_all(pending)?;
            apply_statistics(&mut lattice, &summary.statistics);
            layer_metrics.merge_files = summary.merge_files;
            layer_metrics.merge_waves = summary.waves;
            layer_metrics.merge_ms = clock.elapsed_ms();

            let clock = StageClock::start();
            let validator = Validator::new(
                &self.pool,
                config.validation_window_size,
                filter.clone(),
                config.refine_filter,
            );
            let stats = validator
                .validate(&mut lattice, &summary.final_files)
                .map_err(|e| e.in_stage("validation", &scope))?;
            lattice.clean_candidates();
            layer_metrics.value_groups = stats.value_groups;
            layer_metrics.filter_inserts = stats.filter_inserts;
            if let Some(filter) = &filter {
                let filter = filter.lock();
                layer_metrics.filter_values = filter.num_inserted();
                layer_metrics.filter_bits_set = filter.bits_set();
                layer_metrics.filter_false_positive_rate = filter.false_positive_rate();
                debug!(
                    layer,
                    values = layer_metrics.filter_values,
                    false_positive_rate = layer_metrics.filter_false_positive_rate,
                    "Filter state"
                );
            }
            layer_metrics.validation_ms = clock.elapsed_ms();
            layer_metrics.pinds = lattice.candidate_count();

            sink.layer_finished(layer, &relations, lattice.attributes())
                .map_err(|e| e.in_stage("report", &scope))?;
            remove_files(summary.final_files.values());

            info!(layer, pinds = layer_metrics.pinds, "Finished layer");
            metrics.total_pinds += layer_metrics.pinds;

            if config.is_last_layer(layer) || layer_metrics.pinds == 0 {
                metrics.layers.push(layer_metrics);
                break;
            }
            let clock = StageClock::start();
            let expanded = lattice.generate_next_layer();
            layer_metrics.expansion_ms = clock.elapsed_ms();
            metrics.layers.push(layer_metrics);
            if !expanded {
                break;
            }
        }

        metrics.total_ms = run_clock.elapsed_ms();
        let metrics_file = match &config.result_dir {
            Some(dir) => Some(metrics.write_json(dir).map_err(|e| e.in_stage("report", "run metrics"))?),
            None => None,
        };
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            warn!("Failed to remove work directory {:?}: {}", work_dir, e);
        }

        info!(
            pinds = metrics.total_pinds,
            layers = metrics.layers.len(),
            sort_files = metrics.sort_files(),
            merge_files = metrics.merge_files(),
            elapsed_ms = metrics.total_ms,
            "pIND discovery finished"
        );
        Ok(DiscoveryReport {
            pind_count: metrics.total_pinds,
            metrics,
            metrics_file,
        })
    }

    fn create_work_dir(&self) -> SpindResult<PathBuf> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = self.config.temp_dir.join(format!(
            "{}_{}_{}",
            self.config.execution_name,
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&dir)
            .map_err(|e| SpindError::io_with_path("Failed to create work directory", &dir, &e))?;
        Ok(dir)
    }

    /// Split every input into chunk files, assigning unary attribute offsets
    fn chunk_relations(&self, inputs: Vec<RelationInput>, work_dir: &Path) -> SpindResult<Vec<Relation>> {
        let mut offsets = Vec::with_capacity(inputs.len());
        let mut next = 0;
        for input in &inputs {
            offsets.push(next);
            next += input.source.header().len();
        }

        let chunk_size = self.config.chunk_size;
        self.pool.install(|| {
            inputs
                .into_par_iter()
                .zip(offsets.into_par_iter())
                .enumerate()
                .map(|(id, (mut input, offset))| {
                    Relation::chunk(id, input.name.as_str(), offset, input.source.as_mut(), chunk_size, work_dir)
                        .map_err(|e| e.in_stage("chunking", format!("relation {}", input.name)))
                })
                .collect::<SpindResult<Vec<_>>>()
        })
    }

    /// Aggregate all chunks of the relations in use; returns the runs per relation
    fn aggregate_layer(
        &self,
        relations: &[Relation],
        lattice: &mut Lattice,
        filter: Option<&SharedFilter>,
        work_dir: &Path,
        layer_metrics: &mut LayerMetrics,
    ) -> SpindResult<BTreeMap<RelationId, Vec<PathBuf>>> {
        let layer = lattice.layer();
        let mut targets: BTreeMap<RelationId, Vec<AggregationTarget>> = BTreeMap::new();
        for attribute in lattice.attributes() {
            targets.entry(attribute.relation_id).or_default().push(AggregationTarget {
                id: attribute.id,
                columns: attribute.columns.clone(),
            });
        }

        let jobs: Vec<(&Relation, usize, &PathBuf, &[AggregationTarget])> = targets
            .iter()
            .filter_map(|(&relation_id, targets)| relations.get(relation_id).map(|r| (r, targets)))
            .flat_map(|(relation, targets)| {
                relation
                    .chunks
                    .iter()
                    .enumerate()
                    .map(move |(index, chunk)| (relation, index, chunk, targets.as_slice()))
            })
            .collect();
        debug!(layer, jobs = jobs.len(), "Aggregating chunks");

        let guard = filter.map(|filter| filter.lock());
        let aggregator = Aggregator::new(&self.config, layer, guard.as_deref(), work_dir);
        let outputs: Vec<AggregationOutput> = self.pool.install(|| {
            jobs.par_iter()
                .map(|&(relation, index, chunk, targets)| {
                    aggregator
                        .aggregate(relation.id, index, chunk, targets)
                        .map_err(|e| e.in_stage("aggregation", format!("relation {} chunk {}", relation.name, index)))
                })
                .collect::<SpindResult<Vec<_>>>()
        })?;
        drop(aggregator);
        drop(guard);

        let mut pending: BTreeMap<RelationId, Vec<PathBuf>> =
            targets.keys().map(|&relation_id| (relation_id, Vec::new())).collect();
        let mut statistics: FxHashMap<AttributeId, AttributeMetadata> = FxHashMap::default();
        for output in outputs {
            layer_metrics.sort_files += output.runs.len();
            layer_metrics.spills += output.spills;
            pending.entry(output.relation_id).or_default().extend(output.runs);
            for (id, counters) in output.statistics {
                statistics.entry(id).or_default().merge(&counters);
            }
        }
        layer_metrics.null_rows = statistics.values().map(|s| s.null_count).sum();
        layer_metrics.global_unique_skips = statistics.values().map(|s| s.global_unique_skips).sum();
        apply_statistics(lattice, &statistics);
        Ok(pending)
    }
}

fn apply_statistics(lattice: &mut Lattice, statistics: &FxHashMap<AttributeId, AttributeMetadata>) {
    let attributes = lattice.attributes_mut();
    for (&id, counters) in statistics {
        if let Some(attribute) = attributes.get_mut(id) {
            attribute.metadata.merge(counters);
        }
    }
}

fn remove_files<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove relation file {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::VecRowSource;
    use tempfile::TempDir;

    fn config(dir: &Path) -> DiscoveryConfig {
        DiscoveryConfig {
            temp_dir: dir.to_path_buf(),
            parallelism: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_before_running() {
        let dir = TempDir::new().unwrap();
        let result = SpindEngine::new(DiscoveryConfig {
            threshold: 1.5,
            ..config(dir.path())
        });
        assert!(matches!(result, Err(SpindError::Config { .. })));
    }

    #[test]
    fn test_work_dir_removed_after_success() {
        let dir = TempDir::new().unwrap();
        let engine = SpindEngine::new(config(dir.path())).unwrap();
        let pinds = engine
            .discover(vec![
                RelationInput::new("r", VecRowSource::from_strs(&["a"], &[&["1"], &["2"]])),
                RelationInput::new("s", VecRowSource::from_strs(&["b"], &[&["1"], &["2"], &["3"]])),
            ])
            .unwrap();
        assert_eq!(pinds.len(), 1);
        assert_eq!(pinds[0].to_string(), "(r.a) <= (s.b)");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_no_relations_yield_no_pinds() {
        let dir = TempDir::new().unwrap();
        let engine = SpindEngine::new(config(dir.path())).unwrap();
        assert!(engine.discover(Vec::new()).unwrap().is_empty());
    }
}
