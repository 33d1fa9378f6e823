/// On-disk formats of the pipeline
///
/// Run and relation files are line pairs:
///
/// ```text
/// <value>
/// <attrId>,<count>;<attrId>,<count>;...;
/// ```
///
/// Chunk files hold raw relation rows as Arrow IPC with nullable Utf8 columns.

use crate::error::{retry_once, SpindError, SpindResult};
use crate::metadata::AttributeId;
use arrow::array::{Array, ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Rows per record batch inside a chunk file
const CHUNK_BATCH_ROWS: usize = 8192;

/// Escape a raw cell so run files stay line oriented
pub fn escape_field(raw: &str) -> String {
    if !raw.contains(['\\', '\n', '\r']) {
        return raw.to_string();
    }
    let mut escaped = String::with_capacity(raw.len() + 4);
    for ch in raw.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Prefix of the stored form of a null. `escape_field` only ever emits a
/// backslash followed by `\\`, `n` or `r`, so no real cell can produce it.
pub const NULL_MARKER: &str = "\\N";

/// Stored form of a null under `NullHandling::Equality`
pub fn null_value(token: &str) -> String {
    let mut value = String::from(NULL_MARKER);
    value.push_str(&escape_field(token));
    value
}

/// Build the composite value of a column combination.
///
/// Lengths of all fields but the last are written as a prefix (`:` between
/// them, `|` after the second-to-last) followed by the concatenated fields,
/// so distinct tuples never collide.
pub fn encode_composite<S: AsRef<str>>(fields: &[S]) -> String {
    match fields.len() {
        0 => String::new(),
        1 => fields[0].as_ref().to_string(),
        n => {
            let payload: usize = fields.iter().map(|f| f.as_ref().len()).sum();
            let mut value = String::with_capacity(payload + 4 * n);
            for field in &fields[..n - 2] {
                value.push_str(&field.as_ref().len().to_string());
                value.push(':');
            }
            value.push_str(&fields[n - 2].as_ref().len().to_string());
            value.push('|');
            for field in fields {
                value.push_str(field.as_ref());
            }
            value
        }
    }
}

/// Recover the fields of a composite value of the given arity.
/// Returns `None` when the length prefix does not describe the value.
pub fn split_composite(value: &str, arity: usize) -> Option<Vec<&str>> {
    if arity <= 1 {
        return Some(vec![value]);
    }
    let bar = value.find('|')?;
    let lengths = value[..bar]
        .split(':')
        .map(|len| len.parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;
    if lengths.len() != arity - 1 {
        return None;
    }
    let mut fields = Vec::with_capacity(arity);
    let mut offset = bar + 1;
    for len in lengths {
        let end = offset.checked_add(len)?;
        fields.push(value.get(offset..end)?);
        offset = end;
    }
    fields.push(value.get(offset..)?);
    Some(fields)
}

/// Serialize an attribute-occurrence list; ids must already be ascending
pub fn serialize_attributes(counts: &[(AttributeId, u64)]) -> String {
    let mut line = String::with_capacity(counts.len() * 8);
    for (attribute, count) in counts {
        line.push_str(&attribute.to_string());
        line.push(',');
        line.push_str(&count.to_string());
        line.push(';');
    }
    line
}

/// Parse an attribute-occurrence list. Any malformed pair rejects the line.
pub fn parse_attributes(line: &str) -> Option<Vec<(AttributeId, u64)>> {
    let mut counts = Vec::new();
    for pair in line.split(';') {
        if pair.is_empty() {
            continue;
        }
        let (id, count) = pair.split_once(',')?;
        counts.push((id.parse().ok()?, count.parse().ok()?));
    }
    if counts.is_empty() {
        return None;
    }
    Some(counts)
}

/// One record of a sorted file
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: String,
    /// Serialized attribute-occurrence list, parsed lazily
    pub attributes: String,
    /// Index of the reader the entry came from
    pub reader: usize,
    /// Line number of the value line, for error reports
    pub line: u64,
}

impl Entry {
    pub fn attribute_counts(&self, path: &Path) -> SpindResult<Vec<(AttributeId, u64)>> {
        parse_attributes(&self.attributes).ok_or_else(|| {
            SpindError::malformed(
                format!("Invalid attribute list '{}' for value '{}'", self.attributes, self.value),
                path,
                self.line + 1,
            )
        })
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.reader == other.reader
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.reader.cmp(&other.reader))
    }
}

/// Buffered writer for run and relation files
pub struct RunWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl RunWriter {
    pub fn create(path: &Path) -> SpindResult<Self> {
        let file = retry_once(|| {
            File::create(path)
                .map_err(|e| SpindError::io_with_path("Failed to create run file", path, &e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn write_record(&mut self, value: &str, counts: &[(AttributeId, u64)]) -> SpindResult<()> {
        self.write_raw(value, &serialize_attributes(counts))
    }

    pub fn write_raw(&mut self, value: &str, attributes: &str) -> SpindResult<()> {
        let result = self
            .writer
            .write_all(value.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.write_all(attributes.as_bytes()))
            .and_then(|_| self.writer.write_all(b"\n"));
        result.map_err(|e| SpindError::io_with_path("Failed to write run record", &self.path, &e))?;
        self.records += 1;
        Ok(())
    }

    /// Flush and close, returning the number of records written
    pub fn finish(mut self) -> SpindResult<u64> {
        self.writer
            .flush()
            .map_err(|e| SpindError::io_with_path("Failed to flush run file", &self.path, &e))?;
        Ok(self.records)
    }
}

/// Sequential reader for run and relation files
pub struct RunReader {
    path: PathBuf,
    reader: BufReader<File>,
    index: usize,
    line: u64,
    buf: String,
}

impl RunReader {
    pub fn open(path: &Path, index: usize) -> SpindResult<Self> {
        let file = retry_once(|| {
            File::open(path).map_err(|e| SpindError::io_with_path("Failed to open run file", path, &e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            index,
            line: 0,
            buf: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_line(&mut self) -> SpindResult<Option<String>> {
        self.buf.clear();
        let read = self
            .reader
            .read_line(&mut self.buf)
            .map_err(|e| SpindError::io_with_path("Failed to read run file", &self.path, &e))?;
        if read == 0 {
            return Ok(None);
        }
        self.line += 1;
        if self.buf.ends_with('\n') {
            self.buf.pop();
        }
        Ok(Some(std::mem::take(&mut self.buf)))
    }

    /// Next value/attribute pair; a value line without its partner is fatal
    pub fn next_entry(&mut self) -> SpindResult<Option<Entry>> {
        let value = match self.read_line()? {
            Some(value) => value,
            None => return Ok(None),
        };
        let line = self.line;
        let attributes = self.read_line()?.ok_or_else(|| {
            SpindError::malformed("Value line without attribute line", &self.path, line)
        })?;
        Ok(Some(Entry {
            value,
            attributes,
            reader: self.index,
            line,
        }))
    }
}

/// Arrow IPC storage of horizontal relation chunks
pub struct ArrowChunkFormat;

impl ArrowChunkFormat {
    pub fn schema(width: usize) -> SchemaRef {
        Arc::new(Schema::new(
            (0..width)
                .map(|i| Field::new(format!("c{}", i), DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ))
    }

    /// Write rows as record batches of at most `CHUNK_BATCH_ROWS` rows
    pub fn write_chunk(path: &Path, width: usize, rows: &[Vec<Option<String>>]) -> SpindResult<()> {
        let schema = Self::schema(width);
        let file = File::create(path)
            .map_err(|e| SpindError::io_with_path("Failed to create chunk file", path, &e))?;
        let mut writer = FileWriter::try_new(BufWriter::new(file), &schema)?;
        for slice in rows.chunks(CHUNK_BATCH_ROWS) {
            let columns = (0..width)
                .map(|col| {
                    Arc::new(StringArray::from(
                        slice.iter().map(|row| row[col].as_deref()).collect::<Vec<_>>(),
                    )) as ArrayRef
                })
                .collect::<Vec<_>>();
            let batch = RecordBatch::try_new(schema.clone(), columns)?;
            writer.write(&batch)?;
        }
        writer.finish()?;
        Ok(())
    }

    /// Open a chunk file for batch-wise reading
    pub fn open_chunk(path: &Path) -> SpindResult<FileReader<BufReader<File>>> {
        let file = retry_once(|| {
            File::open(path).map_err(|e| SpindError::io_with_path("Failed to open chunk file", path, &e))
        })?;
        Ok(FileReader::try_new(BufReader::new(file), None)?)
    }

    /// Borrow the string columns of a batch
    pub fn string_columns<'a>(batch: &'a RecordBatch, path: &Path) -> SpindResult<Vec<&'a StringArray>> {
        batch
            .columns()
            .iter()
            .map(|column| {
                column.as_any().downcast_ref::<StringArray>().ok_or_else(|| {
                    SpindError::malformed(
                        format!("Chunk column has type {}, expected Utf8", column.data_type()),
                        path,
                        0,
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_composite_encoding_is_length_prefixed() {
        assert_eq!(encode_composite(&["ab"]), "ab");
        assert_eq!(encode_composite(&["ab", "c"]), "2|abc");
        assert_eq!(encode_composite(&["ab", "c", "def"]), "2:1|abcdef");
    }

    #[test]
    fn test_composite_encoding_avoids_collisions() {
        // Plain concatenation would map both tuples to "abc"
        assert_ne!(encode_composite(&["a", "bc"]), encode_composite(&["ab", "c"]));
        assert_ne!(encode_composite(&["", "x", "y"]), encode_composite(&["x", "", "y"]));
    }

    #[test]
    fn test_split_composite_recovers_fields() {
        let value = encode_composite(&["1|2", "", "a:b"]);
        assert_eq!(split_composite(&value, 3).unwrap(), vec!["1|2", "", "a:b"]);
        assert_eq!(split_composite("plain", 1).unwrap(), vec!["plain"]);
        assert!(split_composite("no-prefix", 2).is_none());
        assert!(split_composite("9|ab", 2).is_none());
    }

    #[test]
    fn test_escape_field_removes_line_breaks() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a\nb"), "a\\nb");
        assert_eq!(escape_field("a\\nb"), "a\\\\nb");
        assert_ne!(escape_field("a\nb"), escape_field("a\\nb"));
    }

    #[test]
    fn test_null_value_never_matches_an_escaped_cell() {
        assert_eq!(null_value(""), "\\N");
        assert_ne!(null_value(""), escape_field(""));
        assert_ne!(null_value(""), escape_field("\\N"));
        assert_ne!(null_value("x"), escape_field("\\Nx"));
        assert!(!escape_field("\\N").starts_with(NULL_MARKER));
    }

    #[test]
    fn test_parse_attributes_rejects_garbage() {
        assert_eq!(parse_attributes("3,2;7,1;").unwrap(), vec![(3, 2), (7, 1)]);
        assert!(parse_attributes("3;").is_none());
        assert!(parse_attributes("x,1;").is_none());
        assert!(parse_attributes("").is_none());
    }

    #[test]
    fn test_run_reader_reads_pairs_and_rejects_orphans() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.txt");
        let mut writer = RunWriter::create(&path).unwrap();
        writer.write_record("a", &[(0, 1)]).unwrap();
        writer.write_record("b", &[(0, 2), (1, 1)]).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let mut reader = RunReader::open(&path, 4).unwrap();
        let first = reader.next_entry().unwrap().unwrap();
        assert_eq!(first.value, "a");
        assert_eq!(first.reader, 4);
        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.attribute_counts(&path).unwrap(), vec![(0, 2), (1, 1)]);
        assert!(reader.next_entry().unwrap().is_none());

        std::fs::write(&path, "orphan\n").unwrap();
        let mut reader = RunReader::open(&path, 0).unwrap();
        assert!(matches!(
            reader.next_entry(),
            Err(SpindError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_chunk_round_trip_keeps_nulls_and_empty_strings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.arrow");
        let rows = vec![
            vec![Some("x".to_string()), None],
            vec![Some(String::new()), Some("y".to_string())],
        ];
        ArrowChunkFormat::write_chunk(&path, 2, &rows).unwrap();

        let reader = ArrowChunkFormat::open_chunk(&path).unwrap();
        let mut seen = Vec::new();
        for batch in reader {
            let batch = batch.unwrap();
            let columns = ArrowChunkFormat::string_columns(&batch, &path).unwrap();
            for row in 0..batch.num_rows() {
                seen.push(
                    columns
                        .iter()
                        .map(|c| (!c.is_null(row)).then(|| c.value(row).to_string()))
                        .collect::<Vec<_>>(),
                );
            }
        }
        assert_eq!(seen, rows);
    }
}
