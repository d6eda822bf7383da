#![forbid(unsafe_code)]
//! Error types for blockfs.
//!
//! Defines `BfsError` and a `Result<T>` alias used throughout the
//! workspace. The driver core has no recoverable error path: a directory
//! lookup miss is `Ok(None)`, everything else here is treated as fatal by
//! callers.

use bfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all blockfs operations.
#[derive(Debug, Error)]
pub enum BfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("not a directory")]
    NotDirectory,

    #[error("not a symlink")]
    NotSymlink,

    #[error("managed memory object was closed")]
    Revoked,

    #[error("range not resident: offset={offset} length={length}")]
    NotResident { offset: usize, length: usize },

    #[error("range out of bounds: offset={offset} length={length} size={size}")]
    OutOfRange {
        offset: usize,
        length: usize,
        size: usize,
    },
}

impl From<ParseError> for BfsError {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using `BfsError`.
pub type Result<T> = std::result::Result<T, BfsError>;
