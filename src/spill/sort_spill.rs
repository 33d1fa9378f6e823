/// SortSpill: bounded fan-in k-way merge of sorted runs
///
/// Runs of one relation are merged in waves of at most `fan_in` inputs until
/// a single final relation file remains. The final merge also produces the
/// occurrence statistics of every attribute of the relation.
use crate::error::{SpindError, SpindResult};
use crate::metadata::{AttributeId, AttributeMetadata, Relation, RelationId};
use crate::spill::format::{RunReader, RunWriter};
use fxhash::FxHashMap;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Output of merging one group of runs
#[derive(Debug, Default)]
pub struct MergeOutput {
    pub path: PathBuf,
    pub records: u64,
    /// Occurrence counters; filled in by the final merge only
    pub statistics: FxHashMap<AttributeId, AttributeMetadata>,
}

/// Merge sorted runs into `destination`.
///
/// Equal values across runs are collapsed into one record with summed
/// per-attribute counts. When `final_merge` is set every flushed group adds
/// its count to the attribute's occurrences and one to its distinct values.
pub fn merge_runs(runs: &[PathBuf], destination: &Path, final_merge: bool) -> SpindResult<MergeOutput> {
    let mut readers = runs
        .iter()
        .enumerate()
        .map(|(index, path)| RunReader::open(path, index))
        .collect::<SpindResult<Vec<_>>>()?;

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for reader in &mut readers {
        if let Some(entry) = reader.next_entry()? {
            heap.push(Reverse(entry));
        }
    }

    let mut writer = RunWriter::create(destination)?;
    let mut output = MergeOutput {
        path: destination.to_path_buf(),
        ..Default::default()
    };
    let mut pending: Option<(String, BTreeMap<AttributeId, u64>)> = None;

    while let Some(Reverse(entry)) = heap.pop() {
        let reader = &mut readers[entry.reader];
        let counts = entry.attribute_counts(reader.path())?;

        let continues_group = pending
            .as_ref()
            .map_or(false, |(value, _)| *value == entry.value);
        if continues_group {
            if let Some((_, group)) = pending.as_mut() {
                for (id, count) in counts {
                    *group.entry(id).or_default() += count;
                }
            }
        } else {
            if let Some((value, group)) = pending.take() {
                flush_group(&mut writer, &mut output, &value, &group, final_merge)?;
            }
            pending = Some((entry.value.clone(), counts.into_iter().collect()));
        }

        if let Some(next) = reader.next_entry()? {
            if next.value <= entry.value {
                return Err(SpindError::malformed(
                    format!("Value '{}' is not above its predecessor '{}'", next.value, entry.value),
                    reader.path(),
                    next.line,
                ));
            }
            heap.push(Reverse(next));
        }
    }
    if let Some((value, group)) = pending.take() {
        flush_group(&mut writer, &mut output, &value, &group, final_merge)?;
    }
    writer.finish()?;
    Ok(output)
}

fn flush_group(
    writer: &mut RunWriter,
    output: &mut MergeOutput,
    value: &str,
    group: &BTreeMap<AttributeId, u64>,
    final_merge: bool,
) -> SpindResult<()> {
    let counts: Vec<(AttributeId, u64)> = group.iter().map(|(&id, &count)| (id, count)).collect();
    writer.write_record(value, &counts)?;
    output.records += 1;
    if final_merge {
        for (id, count) in counts {
            let statistics = output.statistics.entry(id).or_default();
            statistics.total_occurrences += count;
            statistics.distinct_values += 1;
        }
    }
    Ok(())
}

/// Result of merging every relation of a layer
#[derive(Debug, Default)]
pub struct MergeSummary {
    pub final_files: BTreeMap<RelationId, PathBuf>,
    pub statistics: FxHashMap<AttributeId, AttributeMetadata>,
    /// Intermediate and final files written
    pub merge_files: usize,
    pub waves: usize,
}

enum MergeJob {
    Intermediate {
        relation: RelationId,
        runs: Vec<PathBuf>,
        destination: PathBuf,
    },
    Final {
        relation: RelationId,
        runs: Vec<PathBuf>,
        destination: PathBuf,
    },
}

/// Wave scheduler over the runs of all relations of one layer
pub struct MergeScheduler<'a> {
    pool: &'a ThreadPool,
    fan_in: usize,
    temp_dir: &'a Path,
    layer: usize,
}

impl<'a> MergeScheduler<'a> {
    pub fn new(pool: &'a ThreadPool, fan_in: usize, temp_dir: &'a Path, layer: usize) -> Self {
        Self {
            pool,
            fan_in: fan_in.max(2),
            temp_dir,
            layer,
        }
    }

    /// Merge until every relation has exactly one final file. Relations
    /// without runs get an empty final file. Consumed runs are deleted.
    pub fn merge_all(&self, mut pending: BTreeMap<RelationId, Vec<PathBuf>>) -> SpindResult<MergeSummary> {
        let mut summary = MergeSummary::default();
        info!(
            layer = self.layer,
            run_count = pending.values().map(|runs| runs.len()).sum::<usize>(),
            merge_arity = self.fan_in,
            "Merging sorted runs"
        );

        while !pending.is_empty() {
            let wave = summary.waves;
            let mut jobs = Vec::new();
            let mut carried: BTreeMap<RelationId, Vec<PathBuf>> = BTreeMap::new();

            for (relation, runs) in std::mem::take(&mut pending) {
                if runs.len() <= self.fan_in {
                    jobs.push(MergeJob::Final {
                        relation,
                        runs,
                        destination: Relation::relation_file(self.temp_dir, relation),
                    });
                    continue;
                }
                for (n, subset) in runs.chunks(self.fan_in).enumerate() {
                    if subset.len() == 1 {
                        carried.entry(relation).or_default().push(subset[0].clone());
                        continue;
                    }
                    jobs.push(MergeJob::Intermediate {
                        relation,
                        runs: subset.to_vec(),
                        destination: self
                            .temp_dir
                            .join(format!("merge_l{}_r{}_w{}_{}.txt", self.layer, relation, wave, n)),
                    });
                }
            }

            debug!(wave, jobs = jobs.len(), "Starting merge wave");
            let results: Vec<(RelationId, bool, MergeOutput)> = self.pool.install(|| {
                jobs.par_iter()
                    .map(|job| self.execute(job))
                    .collect::<SpindResult<Vec<_>>>()
            })?;

            for (relation, is_final, output) in results {
                summary.merge_files += 1;
                if is_final {
                    for (id, statistics) in output.statistics {
                        summary.statistics.entry(id).or_default().merge(&statistics);
                    }
                    summary.final_files.insert(relation, output.path);
                } else {
                    carried.entry(relation).or_default().push(output.path);
                }
            }
            pending = carried;
            summary.waves += 1;
        }

        info!(
            layer = self.layer,
            waves = summary.waves,
            merge_files = summary.merge_files,
            "Merged sorted runs"
        );
        Ok(summary)
    }

    fn execute(&self, job: &MergeJob) -> SpindResult<(RelationId, bool, MergeOutput)> {
        let (relation, runs, destination, is_final) = match job {
            MergeJob::Intermediate {
                relation,
                runs,
                destination,
            } => (*relation, runs, destination, false),
            MergeJob::Final {
                relation,
                runs,
                destination,
            } => (*relation, runs, destination, true),
        };
        let output = merge_runs(runs, destination, is_final)
            .map_err(|e| e.in_stage("merge", format!("relation {}", relation)))?;
        remove_runs(runs);
        Ok((relation, is_final, output))
    }
}

fn remove_runs(runs: &[PathBuf]) {
    for run in runs {
        if let Err(e) = std::fs::remove_file(run) {
            warn!("Failed to remove merged run file {:?}: {}", run, e);
        }
    }
}
