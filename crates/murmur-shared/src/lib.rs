//! # murmur-shared
//!
//! Identities, domain models and the document decoding boundary shared by
//! the store collaborators and the synchronization core.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::ValidationError;
pub use models::*;
pub use types::{MediaKind, MessageId, UserId};
