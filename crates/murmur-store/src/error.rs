use thiserror::Error;

/// Errors produced by the store collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The remote store could not be reached or refused the call.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A write was rejected by the store.
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// A query expected a document but found none.
    #[error("Record not found")]
    NotFound,

    /// Object exceeds the configured size cap.
    #[error("Object too large: {size} bytes (max {max})")]
    ObjectTooLarge { size: usize, max: usize },

    /// Destination key is empty or escapes the storage root.
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Object upload failed.
    #[error("Object storage error: {0}")]
    ObjectStorage(String),

    /// Generic I/O error (filesystem object store).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
