/// Unified error type for the discovery pipeline
/// Every failure aborts the owning job and, through it, the whole layer
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SpindError {
    /// IO errors: chunk, run, merge and relation file operations
    #[error("IO error: {message}")]
    IO {
        message: String,
        path: Option<String>,
        source_message: Option<String>,
        /// Transient failures are retried once before they surface
        recoverable: bool,
    },

    /// A run or relation file line failed to parse; always an upstream bug
    #[error("Malformed record: {message}")]
    MalformedRecord {
        message: String,
        path: Option<String>,
        line: Option<u64>,
    },

    /// Invalid configuration, raised before any relation is touched
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        field: Option<String>,
    },

    /// A pipeline stage failed for one relation or layer
    #[error("{stage} failed for {scope}: {source}")]
    Stage {
        stage: String,
        scope: String,
        source: Box<SpindError>,
    },
}

impl SpindError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
            path: None,
            source_message: None,
            recoverable: false,
        }
    }

    pub fn io_with_path(message: impl Into<String>, path: &Path, err: &io::Error) -> Self {
        Self::IO {
            message: message.into(),
            path: Some(path.to_string_lossy().to_string()),
            source_message: Some(err.to_string()),
            recoverable: is_transient(err),
        }
    }

    pub fn malformed(message: impl Into<String>, path: &Path, line: u64) -> Self {
        Self::MalformedRecord {
            message: message.into(),
            path: Some(path.to_string_lossy().to_string()),
            line: Some(line),
        }
    }

    pub fn config(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap an error with the stage and scope (relation or layer) it happened in
    pub fn in_stage(self, stage: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            scope: scope.into(),
            source: Box::new(self),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::IO { recoverable, .. } => *recoverable,
            Self::Stage { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }
}

impl From<io::Error> for SpindError {
    fn from(err: io::Error) -> Self {
        Self::IO {
            message: err.to_string(),
            path: None,
            source_message: None,
            recoverable: is_transient(&err),
        }
    }
}

impl From<arrow::error::ArrowError> for SpindError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::IO {
            message: format!("Arrow IPC failure: {}", err),
            path: None,
            source_message: Some(err.to_string()),
            recoverable: false,
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Run an IO operation, retrying once if the first failure is transient
pub fn retry_once<T>(mut op: impl FnMut() -> SpindResult<T>) -> SpindResult<T> {
    match op() {
        Err(err) if err.is_recoverable() => {
            tracing::warn!(error = %err, "Transient IO failure, retrying once");
            op()
        }
        other => other,
    }
}

/// Result type alias for pipeline operations
pub type SpindResult<T> = Result<T, SpindError>;
