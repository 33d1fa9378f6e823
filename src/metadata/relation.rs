/// Relation metadata and horizontal chunking
///
/// Each relation is split into chunk files of at most `chunk_size` rows once,
/// before the first layer. Chunks are the unit of parallel aggregation.

use crate::error::{SpindError, SpindResult};
use crate::ingestion::RowSource;
use crate::metadata::RelationId;
use crate::spill::ArrowChunkFormat;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Relation {
    pub id: RelationId,
    pub name: String,
    pub columns: Vec<String>,
    /// Global id of the relation's first unary attribute
    pub offset: usize,
    pub chunks: Vec<PathBuf>,
    /// Rows dropped because their width differed from the header
    pub skipped_rows: u64,
    pub row_count: u64,
}

impl Relation {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Path of the relation's final merged file for the current layer
    pub fn relation_file(temp_dir: &Path, id: RelationId) -> PathBuf {
        temp_dir.join(format!("relation_{}.txt", id))
    }

    /// Drain a row source into chunk files under `temp_dir`
    pub fn chunk(
        id: RelationId,
        name: impl Into<String>,
        offset: usize,
        source: &mut dyn RowSource,
        chunk_size: usize,
        temp_dir: &Path,
    ) -> SpindResult<Relation> {
        let name = name.into();
        let columns = source.header().to_vec();
        let width = columns.len();
        if width == 0 {
            return Err(SpindError::config(
                format!("Relation '{}' has no columns", name),
                "relations",
            ));
        }

        let mut relation = Relation {
            id,
            name,
            columns,
            offset,
            chunks: Vec::new(),
            skipped_rows: 0,
            row_count: 0,
        };

        let mut buffer: Vec<Vec<Option<String>>> = Vec::with_capacity(chunk_size.min(65_536));
        while let Some(row) = source.next_row()? {
            if row.len() != width {
                relation.skipped_rows += 1;
                continue;
            }
            buffer.push(row);
            relation.row_count += 1;
            if buffer.len() >= chunk_size {
                relation.flush_chunk(&mut buffer, temp_dir)?;
            }
        }
        if !buffer.is_empty() {
            relation.flush_chunk(&mut buffer, temp_dir)?;
        }

        if relation.skipped_rows > 0 {
            warn!(
                relation = %relation.name,
                skipped = relation.skipped_rows,
                "Skipped rows whose width differs from the header"
            );
        }
        debug!(
            relation = %relation.name,
            rows = relation.row_count,
            chunks = relation.chunks.len(),
            "Chunked relation"
        );
        Ok(relation)
    }

    fn flush_chunk(&mut self, buffer: &mut Vec<Vec<Option<String>>>, temp_dir: &Path) -> SpindResult<()> {
        let path = temp_dir.join(format!("r_{}_c_{}.arrow", self.id, self.chunks.len()));
        ArrowChunkFormat::write_chunk(&path, self.width(), buffer)?;
        self.chunks.push(path);
        buffer.clear();
        Ok(())
    }
}
