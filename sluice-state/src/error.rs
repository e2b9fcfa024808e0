use sluice_types::buffer::OutOfBounds;
use sluice_types::Timestamp;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SliceStoreError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("buffer provider could not allocate {size} bytes")]
    AllocationFailed { size: usize },

    #[error("no slice exists for timestamp {timestamp} and no creation function was supplied")]
    MissingSliceCreator { timestamp: Timestamp },

    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("corrupted state: {0}")]
    Corrupted(String),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("operator handler is {actual}, expected {expected}")]
    HandlerState {
        expected: &'static str,
        actual: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, SliceStoreError>;

impl SliceStoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SliceStoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<OutOfBounds> for SliceStoreError {
    fn from(value: OutOfBounds) -> Self {
        SliceStoreError::Corrupted(value.to_string())
    }
}

impl From<bincode::error::EncodeError> for SliceStoreError {
    fn from(value: bincode::error::EncodeError) -> Self {
        match value {
            bincode::error::EncodeError::Io { inner, .. } => SliceStoreError::io("<stream>", inner),
            e => SliceStoreError::Corrupted(format!("failed to encode: {e}")),
        }
    }
}

impl From<bincode::error::DecodeError> for SliceStoreError {
    fn from(value: bincode::error::DecodeError) -> Self {
        match value {
            bincode::error::DecodeError::Io { inner, .. } => SliceStoreError::io("<stream>", inner),
            e => SliceStoreError::Corrupted(format!("failed to decode: {e}")),
        }
    }
}
