/// Reporting of discovered pINDs
///
/// After each layer the orchestrator hands the surviving candidates to a
/// `PindSink`. Sinks see the attribute vector of the finished layer and
/// resolve ids to relation and column names themselves.
use crate::error::{SpindError, SpindResult};
use crate::metadata::{Attribute, Relation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One reported pIND with resolved names
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiscoveredPind {
    pub dependent_relation: String,
    pub dependent_columns: Vec<String>,
    pub referenced_relation: String,
    pub referenced_columns: Vec<String>,
}

impl fmt::Display for DiscoveredPind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <= {}",
            qualified(&self.dependent_relation, &self.dependent_columns),
            qualified(&self.referenced_relation, &self.referenced_columns)
        )
    }
}

fn qualified(relation: &str, columns: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|c| format!("{}.{}", relation, c)).collect();
    format!("({})", names.join(","))
}

fn column_names(relations: &[Relation], attribute: &Attribute) -> (String, Vec<String>) {
    match relations.get(attribute.relation_id) {
        Some(relation) => (
            relation.name.clone(),
            attribute
                .columns
                .iter()
                .map(|&c| relation.columns.get(c).cloned().unwrap_or_else(|| format!("#{}", c)))
                .collect(),
        ),
        None => (
            format!("#{}", attribute.relation_id),
            attribute.columns.iter().map(|c| format!("#{}", c)).collect(),
        ),
    }
}

/// Resolve the surviving candidates of a layer, sorted
pub fn layer_pinds(relations: &[Relation], attributes: &[Attribute]) -> Vec<DiscoveredPind> {
    let mut pinds = Vec::new();
    for attribute in attributes {
        let Some(list) = attribute.referenced.as_ref() else {
            continue;
        };
        let (dependent_relation, dependent_columns) = column_names(relations, attribute);
        for id in list.referenced_ids() {
            let Some(referenced) = attributes.get(id) else {
                continue;
            };
            let (referenced_relation, referenced_columns) = column_names(relations, referenced);
            pinds.push(DiscoveredPind {
                dependent_relation: dependent_relation.clone(),
                dependent_columns: dependent_columns.clone(),
                referenced_relation,
                referenced_columns,
            });
        }
    }
    pinds.sort();
    pinds
}

/// Receiver of per-layer results
pub trait PindSink {
    fn layer_finished(
        &mut self,
        layer: usize,
        relations: &[Relation],
        attributes: &[Attribute],
    ) -> SpindResult<()>;
}

/// Keeps every reported pIND in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    pinds: Vec<DiscoveredPind>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All pINDs reported so far, sorted
    pub fn pinds(&self) -> &[DiscoveredPind] {
        &self.pinds
    }

    pub fn into_pinds(self) -> Vec<DiscoveredPind> {
        self.pinds
    }

    pub fn contains(&self, dependent: &str, referenced: &str) -> bool {
        self.pinds.iter().any(|pind| {
            qualified(&pind.dependent_relation, &pind.dependent_columns) == dependent
                && qualified(&pind.referenced_relation, &pind.referenced_columns) == referenced
        })
    }
}

impl PindSink for CollectingSink {
    fn layer_finished(
        &mut self,
        _layer: usize,
        relations: &[Relation],
        attributes: &[Attribute],
    ) -> SpindResult<()> {
        self.pinds.extend(layer_pinds(relations, attributes));
        self.pinds.sort();
        Ok(())
    }
}

/// Writes `<layer>-ary_pINDs.txt` files, one dependent per line followed by
/// all of its referenced combinations
pub struct TextReportSink {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl TextReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Vec::new(),
        }
    }

    pub fn report_file(dir: &Path, layer: usize) -> PathBuf {
        dir.join(format!("{}-ary_pINDs.txt", layer))
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl PindSink for TextReportSink {
    fn layer_finished(
        &mut self,
        layer: usize,
        relations: &[Relation],
        attributes: &[Attribute],
    ) -> SpindResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SpindError::io_with_path("Failed to create result directory", &self.dir, &e))?;
        let path = Self::report_file(&self.dir, layer);
        let file = std::fs::File::create(&path)
            .map_err(|e| SpindError::io_with_path("Failed to create report file", &path, &e))?;
        let mut writer = BufWriter::new(file);

        let mut lines = Vec::new();
        for attribute in attributes {
            let Some(list) = attribute.referenced.as_ref().filter(|list| !list.is_empty()) else {
                continue;
            };
            let (relation, columns) = column_names(relations, attribute);
            let mut referenced: Vec<String> = list
                .referenced_ids()
                .filter_map(|id| attributes.get(id))
                .map(|target| {
                    let (relation, columns) = column_names(relations, target);
                    qualified(&relation, &columns)
                })
                .collect();
            referenced.sort();
            lines.push(format!("{} <= {}", qualified(&relation, &columns), referenced.join(" ")));
        }
        lines.sort();

        for line in &lines {
            writeln!(writer, "{}", line)
                .map_err(|e| SpindError::io_with_path("Failed to write report file", &path, &e))?;
        }
        writer
            .flush()
            .map_err(|e| SpindError::io_with_path("Failed to flush report file", &path, &e))?;
        self.written.push(path);
        Ok(())
    }
}
