//! Row sources - the boundary between raw tables and the discovery core

use crate::error::{SpindError, SpindResult};
use csv::{ReaderBuilder, StringRecord};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Prefix of generated column names for files without a header
pub const DEFAULT_HEADER_PREFIX: &str = "column";

/// A relation delivered row by row; every cell is an opaque nullable string
pub trait RowSource: Send {
    /// Column names; the width is stable for the whole relation
    fn header(&self) -> &[String];

    /// The next row, or `None` once the relation is exhausted
    fn next_row(&mut self) -> SpindResult<Option<Vec<Option<String>>>>;
}

/// In-memory relation, mostly for tests and embedding
pub struct VecRowSource {
    header: Vec<String>,
    rows: std::vec::IntoIter<Vec<Option<String>>>,
}

impl VecRowSource {
    pub fn new(header: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            header,
            rows: rows.into_iter(),
        }
    }

    /// Build from non-null string cells
    pub fn from_strs(header: &[&str], rows: &[&[&str]]) -> Self {
        Self::new(
            header.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|cell| Some(cell.to_string())).collect())
                .collect(),
        )
    }
}

impl RowSource for VecRowSource {
    fn header(&self) -> &[String] {
        &self.header
    }

    fn next_row(&mut self) -> SpindResult<Option<Vec<Option<String>>>> {
        Ok(self.rows.next())
    }
}

/// Parsing options of a CSV relation
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub separator: u8,
    pub quote: u8,
    /// Character escaping a quote inside a quoted field; `None` allows only doubled quotes
    pub escape: Option<u8>,
    pub has_header: bool,
    /// Drop whitespace at the start of every cell before null matching
    pub ignore_leading_whitespace: bool,
    /// Cells equal to this string become nulls
    pub null_string: String,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            separator: b',',
            quote: b'"',
            escape: Some(b'\\'),
            has_header: true,
            ignore_leading_whitespace: true,
            null_string: String::new(),
        }
    }
}

/// CSV file relation backed by the `csv` crate
pub struct CsvRowSource {
    path: PathBuf,
    reader: csv::Reader<File>,
    header: Vec<String>,
    null_string: String,
    ignore_leading_whitespace: bool,
    /// First data row, read ahead when the header had to be generated
    pending: Option<StringRecord>,
}

impl CsvRowSource {
    pub fn open(path: &Path, options: &CsvOptions) -> SpindResult<Self> {
        let file = File::open(path)
            .map_err(|e| SpindError::io_with_path("Failed to open CSV relation", path, &e))?;
        let mut reader = ReaderBuilder::new()
            .delimiter(options.separator)
            .quote(options.quote)
            .escape(options.escape)
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut first = StringRecord::new();
        let has_first = reader
            .read_record(&mut first)
            .map_err(|e| csv_error(path, e))?;

        let (header, pending) = match (has_first, options.has_header) {
            (false, _) => (Vec::new(), None),
            (true, true) => (first.iter().map(|h| h.to_string()).collect(), None),
            (true, false) => (
                (0..first.len())
                    .map(|i| format!("{}{}", DEFAULT_HEADER_PREFIX, i))
                    .collect(),
                Some(first),
            ),
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            header,
            null_string: options.null_string.clone(),
            ignore_leading_whitespace: options.ignore_leading_whitespace,
            pending,
        })
    }

    fn convert(&self, record: &StringRecord) -> Vec<Option<String>> {
        record
            .iter()
            .map(|cell| {
                let cell = if self.ignore_leading_whitespace { cell.trim_start() } else { cell };
                (cell != self.null_string).then(|| cell.to_string())
            })
            .collect()
    }
}

impl RowSource for CsvRowSource {
    fn header(&self) -> &[String] {
        &self.header
    }

    fn next_row(&mut self) -> SpindResult<Option<Vec<Option<String>>>> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(self.convert(&record)));
        }
        let mut record = StringRecord::new();
        let more = self
            .reader
            .read_record(&mut record)
            .map_err(|e| csv_error(&self.path, e))?;
        Ok(more.then(|| self.convert(&record)))
    }
}

fn csv_error(path: &Path, err: csv::Error) -> SpindError {
    SpindError::IO {
        message: format!("Failed to read CSV relation: {}", err),
        path: Some(path.to_string_lossy().to_string()),
        source_message: Some(err.to_string()),
        recoverable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn drain(source: &mut dyn RowSource) -> Vec<Vec<Option<String>>> {
        let mut rows = Vec::new();
        while let Some(row) = source.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_csv_source_normalizes_nulls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("people.csv");
        std::fs::write(&path, "id,name\n1,ann\n2,\n").unwrap();

        let mut source = CsvRowSource::open(&path, &CsvOptions::default()).unwrap();
        assert_eq!(source.header(), &["id".to_string(), "name".to_string()]);
        let rows = drain(&mut source);
        assert_eq!(rows[0], vec![Some("1".to_string()), Some("ann".to_string())]);
        assert_eq!(rows[1], vec![Some("2".to_string()), None]);
    }

    #[test]
    fn test_csv_source_applies_escape_and_leading_whitespace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quotes.csv");
        std::fs::write(&path, "id,text\n1,\"say \\\"hi\\\"\"\n2,   \n3,  padded \n").unwrap();

        let mut source = CsvRowSource::open(&path, &CsvOptions::default()).unwrap();
        let rows = drain(&mut source);
        assert_eq!(rows[0][1], Some("say \"hi\"".to_string()));
        assert_eq!(rows[1][1], None);
        assert_eq!(rows[2][1], Some("padded ".to_string()));

        let options = CsvOptions {
            ignore_leading_whitespace: false,
            ..Default::default()
        };
        let mut source = CsvRowSource::open(&path, &options).unwrap();
        let rows = drain(&mut source);
        assert_eq!(rows[1][1], Some("   ".to_string()));
        assert_eq!(rows[2][1], Some("  padded ".to_string()));
    }

    #[test]
    fn test_csv_source_generates_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lineitem.tbl");
        std::fs::write(&path, "1|a\n2|b\n").unwrap();

        let options = CsvOptions {
            separator: b'|',
            has_header: false,
            ..Default::default()
        };
        let mut source = CsvRowSource::open(&path, &options).unwrap();
        assert_eq!(source.header(), &["column0".to_string(), "column1".to_string()]);
        assert_eq!(drain(&mut source).len(), 2);
    }

    #[test]
    fn test_vec_source_yields_rows_in_order() {
        let mut source = VecRowSource::from_strs(&["a"], &[&["1"], &["2"]]);
        let rows = drain(&mut source);
        assert_eq!(rows, vec![vec![Some("1".to_string())], vec![Some("2".to_string())]]);
    }
}
