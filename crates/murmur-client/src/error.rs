use thiserror::Error;

use murmur_store::StoreError;

/// Errors surfaced by the synchronization core to its caller.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transient failure reported by a remote collaborator.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The upstream subscription ended before delivering anything.
    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("Message is empty")]
    EmptyMessage,

    /// A media send is already running on this pipeline.
    #[error("A send is already in progress")]
    SendInProgress,

    #[error("No draft at index {0}")]
    DraftNotFound(usize),

    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("Media too large: {size} bytes (max {max})")]
    MediaTooLarge { size: usize, max: usize },

    #[error("Empty media file: {0}")]
    EmptyMedia(String),

    #[error("Invalid profile update: {0}")]
    InvalidProfile(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
