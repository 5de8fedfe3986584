use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VectorError>;

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Invalid vector dimensions: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Corrupt shard {}: {reason}", .path.display())]
    CorruptShard { path: PathBuf, reason: String },
    #[error("Corrupt snapshot {}: {reason}", .path.display())]
    CorruptFile { path: PathBuf, reason: String },
    #[error("I/O failure during {op} on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op} failed on {} ({source}) and closing the file also failed ({close})", .path.display())]
    CloseFailed {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: Box<VectorError>,
        close: io::Error,
    },
    #[error("Shard metadata {} unreadable: {source}", .path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Embedding generation failed: {0}")]
    Embedding(String),
    #[error("Shard task failed: {0}")]
    Task(String),
}

impl VectorError {
    pub(crate) fn io(path: impl Into<PathBuf>, op: &'static str, source: io::Error) -> Self {
        VectorError::Io {
            path: path.into(),
            op,
            source,
        }
    }

    pub(crate) fn corrupt_shard(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        VectorError::CorruptShard {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        VectorError::CorruptFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(VectorError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}
