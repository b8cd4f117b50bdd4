//! # murmur-store
//!
//! Contracts for the remote collaborators consumed by the synchronization
//! core (live query feed, document fetch/subscribe, object storage) plus
//! reference implementations used by tests and local runs.
//!
//! The real store is external. [`MemoryBackend`] reproduces its observable
//! behaviour: ordered initial snapshots, incremental add/modify/remove
//! batches, server-assigned ids and timestamps, and listeners that stay
//! attached until their guard is dropped.

pub mod backend;
pub mod memory;
pub mod objects;

mod error;

pub use backend::{
    DocumentStore, FeedQuery, Listener, ListenerGuard, LiveQueryFeed, ObjectStorage, SetOptions,
};
pub use error::{Result, StoreError};
pub use memory::MemoryBackend;
pub use murmur_shared::protocol::{DocChange, Document, Fields};
pub use objects::{FsObjectStore, MemoryObjectStore};
