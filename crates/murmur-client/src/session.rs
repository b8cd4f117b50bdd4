//! Explicit session context and collaborator handles.
//!
//! Every component receives the [`SessionContext`] and the [`Backends`] it
//! needs at construction; nothing looks up "the current user" globally.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use murmur_shared::UserId;
use murmur_store::{DocumentStore, LiveQueryFeed, MemoryBackend, ObjectStorage};

/// The signed-in identity this process acts for.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub user: UserId,
    pub display_name: Option<String>,
    pub email: Option<String>,
    /// Unique per process; distinguishes concurrent sessions of one user.
    pub session_id: Uuid,
    pub established_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            display_name: None,
            email: None,
            session_id: Uuid::new_v4(),
            established_at: Utc::now(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Whether `author` is the local user.
    pub fn is_me(&self, author: &UserId) -> bool {
        &self.user == author
    }
}

/// Remote collaborators consumed by the core.
#[derive(Clone)]
pub struct Backends {
    pub feed: Arc<dyn LiveQueryFeed>,
    pub documents: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStorage>,
}

impl Backends {
    pub fn new(
        feed: Arc<dyn LiveQueryFeed>,
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            feed,
            documents,
            objects,
        }
    }

    /// Feed and documents served by one in-memory backend.
    pub fn memory(backend: MemoryBackend, objects: Arc<dyn ObjectStorage>) -> Self {
        let backend = Arc::new(backend);
        Self {
            feed: backend.clone(),
            documents: backend,
            objects,
        }
    }
}
