/// Spill-sort aggregation of one relation chunk
///
/// Builds `value -> attributeId -> count` in memory and spills sorted runs
/// whenever the number of held `(value, attribute)` pairs exceeds the budget.
/// Values that are already frequent leave memory first; infrequent ones are
/// kept in the hope of collapsing more occurrences before the next spill.
use crate::config::{DiscoveryConfig, NullHandling};
use crate::error::{SpindError, SpindResult};
use crate::execution::BloomFilter;
use crate::metadata::{AttributeId, AttributeMetadata, RelationId};
use crate::spill::format::{encode_composite, escape_field, null_value, ArrowChunkFormat, RunWriter};
use arrow::array::Array;
use fxhash::FxHashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Spills of a single chunk above which aggregation is thrashing
pub const SPILL_THRASH_WARNING: usize = 64;

/// One attribute combination to aggregate from a relation's chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationTarget {
    pub id: AttributeId,
    pub columns: Vec<usize>,
}

/// Result of aggregating one chunk
#[derive(Debug, Default)]
pub struct AggregationOutput {
    pub relation_id: RelationId,
    pub runs: Vec<PathBuf>,
    /// Only `null_count` and `global_unique_skips` are filled in here; the
    /// occurrence counters are produced by the final merge
    pub statistics: FxHashMap<AttributeId, AttributeMetadata>,
    pub spills: usize,
    pub rows: u64,
}

/// Aggregation settings shared by all jobs of a layer
pub struct Aggregator<'a> {
    layer: usize,
    budget: usize,
    keep_threshold: u64,
    /// Stored form of a null; `None` keeps nulls out of the runs
    null_value: Option<String>,
    /// Present only when unique values may be skipped in this layer
    filter: Option<&'a BloomFilter>,
    run_dir: &'a Path,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        config: &'a DiscoveryConfig,
        layer: usize,
        filter: Option<&'a BloomFilter>,
        run_dir: &'a Path,
    ) -> Self {
        let skipping = layer > 1 && config.skips_unique_values();
        Self {
            layer,
            budget: config.sort_budget_per_job(),
            keep_threshold: config.keep_threshold,
            null_value: (config.null_handling == NullHandling::Equality)
                .then(|| null_value(&config.null_token)),
            filter: filter.filter(|_| skipping),
            run_dir,
        }
    }

    /// Aggregate one chunk file into sorted runs
    pub fn aggregate(
        &self,
        relation_id: RelationId,
        chunk_index: usize,
        chunk: &Path,
        targets: &[AggregationTarget],
    ) -> SpindResult<AggregationOutput> {
        let mut state = ChunkAggregation {
            aggregator: self,
            relation_id,
            chunk_index,
            values: FxHashMap::default(),
            pairs: 0,
            output: AggregationOutput {
                relation_id,
                ..Default::default()
            },
        };
        for target in targets {
            state.output.statistics.entry(target.id).or_default();
        }
        if targets.is_empty() {
            return Ok(state.output);
        }

        let mut used_columns: Vec<usize> = targets.iter().flat_map(|t| t.columns.iter().copied()).collect();
        used_columns.sort_unstable();
        used_columns.dedup();

        let reader = ArrowChunkFormat::open_chunk(chunk)?;
        let mut cells: Vec<Option<String>> = Vec::new();
        let mut unique: Vec<bool> = Vec::new();

        for batch in reader {
            let batch = batch?;
            let columns = ArrowChunkFormat::string_columns(&batch, chunk)?;
            let width = columns.len();
            if let Some(&max) = used_columns.last() {
                if max >= width {
                    return Err(SpindError::malformed(
                        format!("Chunk has {} columns, attribute needs column {}", width, max),
                        chunk,
                        0,
                    ));
                }
            }
            cells.resize(width, None);
            unique.resize(width, false);

            for row in 0..batch.num_rows() {
                state.output.rows += 1;
                for &col in &used_columns {
                    let column = columns[col];
                    cells[col] = if column.is_null(row) {
                        self.null_value.clone()
                    } else {
                        Some(escape_field(column.value(row)))
                    };
                    unique[col] = match (self.filter, cells[col].as_deref()) {
                        (Some(filter), Some(value)) => !filter.might_contain(value),
                        _ => false,
                    };
                }

                let mut fields: Vec<&str> = Vec::with_capacity(4);
                for target in targets {
                    fields.clear();
                    let mut null = false;
                    for &col in &target.columns {
                        match cells[col].as_deref() {
                            Some(value) => fields.push(value),
                            None => {
                                null = true;
                                break;
                            }
                        }
                    }
                    let statistics = state.output.statistics.entry(target.id).or_default();
                    if null {
                        statistics.null_count += 1;
                        continue;
                    }
                    if target.columns.iter().any(|&col| unique[col]) {
                        statistics.global_unique_skips += 1;
                        continue;
                    }
                    state.add(encode_composite(fields.as_slice()), target.id);
                    if state.pairs > self.budget {
                        state.spill(false)?;
                    }
                }
            }
        }
        state.spill(true)?;

        if state.output.spills > SPILL_THRASH_WARNING {
            warn!(
                relation = relation_id,
                chunk = chunk_index,
                spills = state.output.spills,
                budget = self.budget,
                "Aggregation spilled more often than expected; consider a larger sort budget"
            );
        }
        debug!(
            relation = relation_id,
            chunk = chunk_index,
            layer = self.layer,
            rows = state.output.rows,
            runs = state.output.runs.len(),
            "Aggregated chunk"
        );
        Ok(state.output)
    }
}

struct ChunkAggregation<'s, 'a> {
    aggregator: &'s Aggregator<'a>,
    relation_id: RelationId,
    chunk_index: usize,
    values: FxHashMap<String, Vec<(AttributeId, u64)>>,
    pairs: usize,
    output: AggregationOutput,
}

impl ChunkAggregation<'_, '_> {
    fn add(&mut self, value: String, attribute: AttributeId) {
        let counts = self.values.entry(value).or_default();
        match counts.iter_mut().find(|(id, _)| *id == attribute) {
            Some((_, count)) => *count += 1,
            None => {
                counts.push((attribute, 1));
                self.pairs += 1;
            }
        }
    }

    /// Write held values as one sorted run
    fn spill(&mut self, final_flush: bool) -> SpindResult<()> {
        if self.values.is_empty() {
            return Ok(());
        }
        let keep_threshold = self.aggregator.keep_threshold;
        let mut write_all = final_flush || keep_threshold == 0;

        let mut keys: Vec<String> = if write_all {
            self.values.keys().cloned().collect()
        } else {
            let (frequent, retained_pairs) = self.values.iter().fold(
                (Vec::new(), 0usize),
                |(mut frequent, retained), (value, counts)| {
                    let total: u64 = counts.iter().map(|(_, count)| count).sum();
                    if total >= keep_threshold {
                        frequent.push(value.clone());
                        (frequent, retained)
                    } else {
                        (frequent, retained + counts.len())
                    }
                },
            );
            if retained_pairs > self.aggregator.budget / 2 {
                write_all = true;
                self.values.keys().cloned().collect()
            } else {
                frequent
            }
        };
        if keys.is_empty() {
            return Ok(());
        }
        keys.sort_unstable();

        let path = self.aggregator.run_dir.join(format!(
            "sort_l{}_r{}_c{}_{}.txt",
            self.aggregator.layer,
            self.relation_id,
            self.chunk_index,
            self.output.runs.len()
        ));
        let mut writer = RunWriter::create(&path)?;
        for key in &keys {
            if let Some(mut counts) = self.values.remove(key) {
                self.pairs -= counts.len();
                counts.sort_unstable_by_key(|(id, _)| *id);
                writer.write_record(key, &counts)?;
            }
        }
        writer.finish()?;
        self.output.runs.push(path);
        if !final_flush {
            self.output.spills += 1;
        }
        if write_all {
            debug_assert!(self.values.is_empty());
            self.values = FxHashMap::default();
            self.pairs = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spill::format::RunReader;
    use tempfile::TempDir;

    fn rows(data: &[&[Option<&str>]]) -> Vec<Vec<Option<String>>> {
        data.iter()
            .map(|row| row.iter().map(|cell| cell.map(|c| c.to_string())).collect())
            .collect()
    }

    fn read_all(path: &Path) -> Vec<(String, Vec<(AttributeId, u64)>)> {
        let mut reader = RunReader::open(path, 0).unwrap();
        let mut records = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            let counts = entry.attribute_counts(path).unwrap();
            records.push((entry.value, counts));
        }
        records
    }

    fn targets() -> Vec<AggregationTarget> {
        vec![
            AggregationTarget { id: 0, columns: vec![0] },
            AggregationTarget { id: 1, columns: vec![1] },
        ]
    }

    #[test]
    fn test_single_run_counts_and_nulls() {
        let dir = TempDir::new().unwrap();
        let chunk = dir.path().join("chunk.arrow");
        ArrowChunkFormat::write_chunk(
            &chunk,
            2,
            &rows(&[&[Some("a"), Some("a")], &[Some("b"), None], &[Some("a"), Some("c")]]),
        )
        .unwrap();

        let config = DiscoveryConfig::default();
        let aggregator = Aggregator::new(&config, 1, None, dir.path());
        let output = aggregator.aggregate(0, 0, &chunk, &targets()).unwrap();

        assert_eq!(output.runs.len(), 1);
        assert_eq!(output.spills, 0);
        assert_eq!(output.statistics[&1].null_count, 1);
        assert_eq!(
            read_all(&output.runs[0]),
            vec![
                ("a".to_string(), vec![(0, 2), (1, 1)]),
                ("b".to_string(), vec![(0, 1)]),
                ("c".to_string(), vec![(1, 1)]),
            ]
        );
    }

    #[test]
    fn test_small_budget_spills_sorted_runs() {
        let dir = TempDir::new().unwrap();
        let chunk = dir.path().join("chunk.arrow");
        let data: Vec<Vec<Option<String>>> = (0..20)
            .map(|i| vec![Some(format!("v{:02}", i)), Some(format!("w{:02}", i % 5))])
            .collect();
        ArrowChunkFormat::write_chunk(&chunk, 2, &data).unwrap();

        let config = DiscoveryConfig {
            sort_memory_budget: 4,
            parallelism: 1,
            ..Default::default()
        };
        let aggregator = Aggregator::new(&config, 1, None, dir.path());
        let output = aggregator.aggregate(0, 0, &chunk, &targets()).unwrap();
        assert!(output.spills > 0);

        let mut total: FxHashMap<AttributeId, u64> = FxHashMap::default();
        for run in &output.runs {
            let records = read_all(run);
            assert!(records.windows(2).all(|w| w[0].0 < w[1].0), "run is not sorted");
            for (_, counts) in records {
                for (id, count) in counts {
                    *total.entry(id).or_default() += count;
                }
            }
        }
        assert_eq!(total[&0], 20);
        assert_eq!(total[&1], 20);
    }

    #[test]
    fn test_equality_mode_substitutes_null_token() {
        let dir = TempDir::new().unwrap();
        let chunk = dir.path().join("chunk.arrow");
        ArrowChunkFormat::write_chunk(&chunk, 2, &rows(&[&[None, Some("x")]])).unwrap();

        let config = DiscoveryConfig {
            null_handling: NullHandling::Equality,
            null_token: "<null>".to_string(),
            ..Default::default()
        };
        let aggregator = Aggregator::new(&config, 1, None, dir.path());
        let output = aggregator.aggregate(0, 0, &chunk, &targets()).unwrap();
        assert_eq!(output.statistics[&0].null_count, 0);
        assert_eq!(read_all(&output.runs[0])[0], ("\\N<null>".to_string(), vec![(0, 1)]));
    }

    #[test]
    fn test_filter_skips_unique_column_values() {
        let dir = TempDir::new().unwrap();
        let chunk = dir.path().join("chunk.arrow");
        ArrowChunkFormat::write_chunk(
            &chunk,
            2,
            &rows(&[&[Some("shared"), Some("k")], &[Some("lonely"), Some("k")]]),
        )
        .unwrap();

        let mut filter = BloomFilter::with_expected_size(10);
        filter.insert("shared");
        filter.insert("k");

        let config = DiscoveryConfig::default();
        let aggregator = Aggregator::new(&config, 2, Some(&filter), dir.path());
        let target = [AggregationTarget { id: 0, columns: vec![0, 1] }];
        let output = aggregator.aggregate(0, 0, &chunk, &target).unwrap();

        assert_eq!(output.statistics[&0].global_unique_skips, 1);
        let records = read_all(&output.runs[0]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, encode_composite(&["shared", "k"]));
    }

    #[test]
    fn test_filter_ignored_in_first_layer() {
        let dir = TempDir::new().unwrap();
        let chunk = dir.path().join("chunk.arrow");
        ArrowChunkFormat::write_chunk(&chunk, 1, &rows(&[&[Some("lonely")]])).unwrap();

        let filter = BloomFilter::with_expected_size(10);
        let config = DiscoveryConfig::default();
        let aggregator = Aggregator::new(&config, 1, Some(&filter), dir.path());
        let target = [AggregationTarget { id: 0, columns: vec![0] }];
        let output = aggregator.aggregate(0, 0, &chunk, &target).unwrap();
        assert_eq!(output.statistics[&0].global_unique_skips, 0);
        assert_eq!(output.runs.len(), 1);
    }
}
