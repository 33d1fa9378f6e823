/// Streaming multi-relation merge-join over the final relation files
///
/// Every relation file is read through a bounded look-ahead buffer. Entries up
/// to the flush bound are drained from all buffers, regrouped by value and fed
/// to the lattice one value group at a time, in value order.
use crate::error::{SpindError, SpindResult};
use crate::execution::SharedFilter;
use crate::lattice::{Lattice, ValueGroup};
use crate::metadata::RelationId;
use crate::spill::format::{split_composite, Entry, RunReader};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Counters of one validation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub value_groups: u64,
    /// Groups that contained an active dependent and reached the lattice
    pub pruning_groups: u64,
    pub filter_inserts: u64,
    pub rounds: u64,
}

struct ValidationReader {
    relation: RelationId,
    reader: RunReader,
    buffer: VecDeque<Entry>,
    /// Last value read from the file, kept across drained rounds
    last_value: Option<String>,
    finished: bool,
}

impl ValidationReader {
    fn open(relation: RelationId, path: &Path, index: usize, window: usize) -> SpindResult<Self> {
        Ok(Self {
            relation,
            reader: RunReader::open(path, index)?,
            buffer: VecDeque::with_capacity(window),
            last_value: None,
            finished: false,
        })
    }

    /// Read until the buffer is full or the file is exhausted
    fn refill(&mut self, window: usize) -> SpindResult<()> {
        while !self.finished && self.buffer.len() < window {
            match self.reader.next_entry()? {
                Some(entry) => {
                    if let Some(last) = &self.last_value {
                        if entry.value <= *last {
                            return Err(SpindError::malformed(
                                format!(
                                    "Relation file is not strictly sorted: '{}' follows '{}'",
                                    entry.value, last
                                ),
                                self.reader.path(),
                                entry.line,
                            ));
                        }
                    }
                    self.last_value = Some(entry.value.clone());
                    self.buffer.push_back(entry);
                }
                None => self.finished = true,
            }
        }
        Ok(())
    }

    /// Largest value this reader can vouch for; `None` once nothing is left to read
    fn bound(&self) -> Option<&str> {
        if self.finished {
            return None;
        }
        self.buffer.back().map(|entry| entry.value.as_str())
    }

    fn is_exhausted(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }
}

/// Validator for one layer
pub struct Validator<'a> {
    pool: &'a ThreadPool,
    window: usize,
    filter: Option<SharedFilter>,
    refine_filter: bool,
}

impl<'a> Validator<'a> {
    pub fn new(pool: &'a ThreadPool, window: usize, filter: Option<SharedFilter>, refine_filter: bool) -> Self {
        Self {
            pool,
            window: window.max(1),
            filter,
            refine_filter,
        }
    }

    /// Prune `lattice` against the final files of the relations in use
    pub fn validate(
        &self,
        lattice: &mut Lattice,
        files: &BTreeMap<RelationId, PathBuf>,
    ) -> SpindResult<ValidationStats> {
        let layer = lattice.layer();
        lattice.calculate_violations();
        lattice.prune_null();
        if layer > 1 {
            lattice.prune_global_unique();
        }

        let inserts_filter = self.filter.is_some() && (layer == 1 || self.refine_filter);
        if let (Some(filter), true) = (&self.filter, self.refine_filter) {
            filter.lock().clear();
        }

        let mut readers = files
            .iter()
            .enumerate()
            .map(|(index, (&relation, path))| ValidationReader::open(relation, path, index, self.window))
            .collect::<SpindResult<Vec<_>>>()?;
        let paths: Vec<PathBuf> = files.values().cloned().collect();

        info!(
            layer,
            relations = readers.len(),
            candidates = lattice.candidate_count(),
            "Validating candidates"
        );

        let mut stats = ValidationStats::default();
        loop {
            let window = self.window;
            self.pool
                .install(|| readers.par_iter_mut().try_for_each(|reader| reader.refill(window)))?;
            readers.retain(|reader| {
                let exhausted = reader.is_exhausted();
                if exhausted {
                    debug!(relation = reader.relation, "Relation file exhausted");
                }
                !exhausted
            });
            if readers.is_empty() {
                break;
            }
            stats.rounds += 1;

            let bound: Option<String> = readers
                .iter()
                .filter_map(|reader| reader.bound())
                .min()
                .map(str::to_string);

            let mut drained: Vec<Entry> = Vec::new();
            for reader in &mut readers {
                while let Some(front) = reader.buffer.front() {
                    if bound.as_deref().map_or(false, |bound| front.value.as_str() > bound) {
                        break;
                    }
                    if let Some(entry) = reader.buffer.pop_front() {
                        drained.push(entry);
                    }
                }
            }
            drained.sort_unstable();

            let groups = self.build_groups(lattice, &drained, &paths, layer, inserts_filter)?;
            stats.value_groups += count_values(&drained);
            for (group, inserted) in &groups {
                stats.filter_inserts += inserted;
                if let Some(group) = group {
                    stats.pruning_groups += 1;
                    lattice.prune(group);
                }
            }
        }

        debug!(
            layer,
            value_groups = stats.value_groups,
            pruning_groups = stats.pruning_groups,
            filter_inserts = stats.filter_inserts,
            rounds = stats.rounds,
            "Validation finished"
        );
        Ok(stats)
    }

    /// Parse drained entries into value groups in parallel, inserting filter
    /// values on the way. Groups without an active dependent come back as `None`.
    fn build_groups(
        &self,
        lattice: &Lattice,
        drained: &[Entry],
        paths: &[PathBuf],
        layer: usize,
        inserts_filter: bool,
    ) -> SpindResult<Vec<(Option<ValueGroup>, u64)>> {
        let spans: Vec<&[Entry]> = drained
            .chunk_by(|a, b| a.value == b.value)
            .collect();

        self.pool.install(|| {
            spans
                .par_iter()
                .map(|span| -> SpindResult<(Option<ValueGroup>, u64)> {
                    let mut group = ValueGroup::default();
                    for entry in span.iter() {
                        for (id, count) in entry.attribute_counts(&paths[entry.reader])? {
                            *group.entry(id).or_default() += count;
                        }
                    }
                    if !group.keys().any(|&id| lattice.is_active(id)) {
                        return Ok((None, 0));
                    }

                    let mut inserted = 0;
                    if inserts_filter && group.len() >= 2 {
                        if let Some(filter) = &self.filter {
                            let value = span[0].value.as_str();
                            let fields = split_composite(value, layer).ok_or_else(|| {
                                SpindError::malformed(
                                    format!("Value '{}' is not a composite of arity {}", value, layer),
                                    &paths[span[0].reader],
                                    span[0].line,
                                )
                            })?;
                            inserted = fields.len() as u64;
                            filter.lock().insert_batch(fields);
                        }
                    }
                    Ok((Some(group), inserted))
                })
                .collect::<SpindResult<Vec<_>>>()
        })
    }
}

fn count_values(sorted: &[Entry]) -> u64 {
    sorted.chunk_by(|a, b| a.value == b.value).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::execution::BloomFilter;
    use crate::metadata::{AttributeId, Relation};
    use crate::spill::format::RunWriter;
    use tempfile::TempDir;

    fn write_file(path: &Path, records: &[(&str, &[(AttributeId, u64)])]) {
        let mut writer = RunWriter::create(path).unwrap();
        for (value, counts) in records {
            writer.write_record(value, counts).unwrap();
        }
        writer.finish().unwrap();
    }

    fn relation(id: RelationId, offset: usize, columns: &[&str]) -> Relation {
        Relation {
            id,
            name: format!("r{}", id),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            offset,
            chunks: Vec::new(),
            skipped_rows: 0,
            row_count: 0,
        }
    }

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    /// R(a) = [1,2,3] and S(b) = [1,2,3,4]
    fn scenario(dir: &Path) -> (Lattice, BTreeMap<RelationId, PathBuf>) {
        let mut lattice = Lattice::new(&DiscoveryConfig::default());
        lattice.load_unary(&[relation(0, 0, &["a"]), relation(1, 1, &["b"])]);
        lattice.attributes_mut()[0].metadata.total_occurrences = 3;
        lattice.attributes_mut()[0].metadata.distinct_values = 3;
        lattice.attributes_mut()[1].metadata.total_occurrences = 4;
        lattice.attributes_mut()[1].metadata.distinct_values = 4;

        let r = Relation::relation_file(dir, 0);
        let s = Relation::relation_file(dir, 1);
        write_file(&r, &[("1", &[(0, 1)]), ("2", &[(0, 1)]), ("3", &[(0, 1)])]);
        write_file(&s, &[("1", &[(1, 1)]), ("2", &[(1, 1)]), ("3", &[(1, 1)]), ("4", &[(1, 1)])]);
        (lattice, [(0, r), (1, s)].into_iter().collect())
    }

    #[test]
    fn test_exact_inclusion_survives_with_tiny_window() {
        let dir = TempDir::new().unwrap();
        let (mut lattice, files) = scenario(dir.path());
        let pool = pool();
        let validator = Validator::new(&pool, 1, None, false);
        let stats = validator.validate(&mut lattice, &files).unwrap();
        lattice.clean_candidates();

        assert_eq!(stats.value_groups, 4);
        assert!(lattice.attributes()[0].referenced.as_ref().unwrap().contains(1));
        assert!(lattice.attributes()[1].referenced.is_none());
    }

    #[test]
    fn test_filter_receives_shared_values() {
        let dir = TempDir::new().unwrap();
        let (mut lattice, files) = scenario(dir.path());
        let pool = pool();
        let filter = BloomFilter::shared(100);
        let validator = Validator::new(&pool, 2, Some(filter.clone()), true);
        let stats = validator.validate(&mut lattice, &files).unwrap();

        assert_eq!(stats.filter_inserts, 3);
        let filter = filter.lock();
        assert!(filter.might_contain("1") && filter.might_contain("3"));
    }

    #[test]
    fn test_unsorted_relation_file_is_malformed() {
        let dir = TempDir::new().unwrap();
        let (_, mut files) = scenario(dir.path());
        let broken = dir.path().join("broken.txt");
        write_file(&broken, &[("2", &[(1, 1)]), ("1", &[(1, 1)])]);
        files.insert(1, broken);

        let pool = pool();
        for window in [8, 1] {
            let (mut lattice, _) = scenario(dir.path());
            let validator = Validator::new(&pool, window, None, false);
            let err = validator.validate(&mut lattice, &files).unwrap_err();
            assert!(matches!(err, SpindError::MalformedRecord { .. }), "window {}", window);
        }
    }
}
