//! Collaborator contracts consumed by the synchronization core.
//!
//! Every listener is returned together with a [`ListenerGuard`]; dropping
//! the guard detaches the upstream listener. Holders must keep the guard
//! for exactly as long as they consume the change stream.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use murmur_shared::protocol::{DocChange, Document, Fields};

use crate::error::Result;

/// A "most recent N" query over one collection, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedQuery {
    pub collection: String,
    /// Field holding the server-assigned ordering key.
    pub order_by: String,
    /// Maximum number of documents in the window.
    pub limit: usize,
}

impl FeedQuery {
    pub fn newest(collection: impl Into<String>, order_by: impl Into<String>, limit: usize) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            limit,
        }
    }
}

/// Options for [`DocumentStore::set`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge into the existing document instead of replacing it.
    pub merge: bool,
    /// Field the store fills with its own acknowledgement timestamp.
    pub stamp_field: Option<String>,
}

impl SetOptions {
    pub fn merge() -> Self {
        Self {
            merge: true,
            stamp_field: None,
        }
    }

    pub fn stamped(mut self, field: impl Into<String>) -> Self {
        self.stamp_field = Some(field.into());
        self
    }
}

/// Scoped registration of an upstream listener.
pub struct ListenerGuard {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self { detach: None }
    }

    /// Detach the upstream listener now. Calling it again is a no-op.
    pub fn detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.detach.is_some()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// A live listener: raw change callbacks plus the guard that keeps them flowing.
#[derive(Debug)]
pub struct Listener {
    pub changes: mpsc::UnboundedReceiver<Vec<DocChange>>,
    pub guard: ListenerGuard,
}

impl Listener {
    pub fn new(changes: mpsc::UnboundedReceiver<Vec<DocChange>>, guard: ListenerGuard) -> Self {
        Self { changes, guard }
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Vec<DocChange>>, ListenerGuard) {
        (self.changes, self.guard)
    }
}

/// Live query feed over an ordered collection.
#[async_trait]
pub trait LiveQueryFeed: Send + Sync {
    /// Start listening. The first callback is the full current window in
    /// descending order; later callbacks carry incremental changes.
    async fn listen_query(&self, query: &FeedQuery) -> Result<Listener>;

    /// Append a document. The store assigns the id and, when `stamp_field`
    /// is given, writes its acknowledgement timestamp into that field.
    async fn add(&self, collection: &str, fields: Fields, stamp_field: Option<&str>)
        -> Result<String>;
}

/// Keyed document fetch/subscribe.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Start listening to one document. The first callback carries the
    /// current value when the document exists.
    async fn listen_document(&self, collection: &str, id: &str) -> Result<Listener>;

    async fn set(&self, collection: &str, id: &str, fields: Fields, options: SetOptions)
        -> Result<()>;
}

/// Durable object storage returning publicly resolvable references.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<String>;
}
