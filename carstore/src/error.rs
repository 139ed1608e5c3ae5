//! Error types for the carstore crate.

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while opening, indexing or reading archives
#[derive(Error, Debug)]
pub enum StoreError {
    /// Archive absent from durable storage
    #[error("archive {0} not found")]
    ArchiveNotFound(String),

    /// Block absent from an archive that does exist
    #[error("block {block} not found in archive {archive}")]
    BlockNotFound { archive: String, block: String },

    /// Embedded index is malformed. Fatal for this archive only.
    #[error("archive {archive} index corrupt: {reason}")]
    IndexCorrupt { archive: String, reason: String },

    /// Archive has no blocks to sample from
    #[error("archive {0} has no blocks")]
    EmptyArchive(String),

    /// Node holds no archives to sample from
    #[error("no archives available for sampling")]
    NoAssets,

    #[error("invalid identifier: {0}")]
    InvalidCid(#[from] common::CidError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

impl StoreError {
    /// Whether the error means "not present" rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ArchiveNotFound(_) | StoreError::BlockNotFound { .. }
        )
    }
}
