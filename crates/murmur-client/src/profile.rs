//! Edits to the local user's own profile.
//!
//! The write is a merge into `users/{id}`; the new values come back to
//! every reader, this session included, through the directory's live
//! subscription.

use serde_json::json;
use tracing::{info, warn};

use murmur_shared::protocol::Fields;
use murmur_store::{DocumentStore, SetOptions};

use crate::error::{ClientError, Result};
use crate::session::SessionContext;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn avatar_url(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    /// Document fields to merge. Names are trimmed; blank values and
    /// empty updates are refused.
    pub fn to_fields(&self) -> Result<Fields> {
        let mut fields = Fields::new();
        if let Some(name) = &self.display_name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ClientError::InvalidProfile("display name is blank".into()));
            }
            fields.insert("displayName".into(), json!(name));
        }
        if let Some(url) = &self.avatar_url {
            let url = url.trim();
            if url.is_empty() {
                return Err(ClientError::InvalidProfile("avatar url is blank".into()));
            }
            fields.insert("photoURL".into(), json!(url));
        }
        if fields.is_empty() {
            return Err(ClientError::InvalidProfile("nothing to update".into()));
        }
        Ok(fields)
    }
}

/// Merge `update` into the session user's profile document.
pub async fn update_own_profile(
    documents: &dyn DocumentStore,
    users_collection: &str,
    session: &SessionContext,
    update: &ProfileUpdate,
) -> Result<()> {
    let fields = update.to_fields()?;
    let user = session.user.as_str();
    if let Err(e) = documents
        .set(users_collection, user, fields, SetOptions::merge())
        .await
    {
        warn!(user, error = %e, "Profile update failed");
        return Err(e.into());
    }
    info!(user, "Profile updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use murmur_shared::UserId;
    use murmur_store::{MemoryBackend, MemoryObjectStore};
    use serde_json::Value;

    use crate::config::ClientConfig;
    use crate::directory::UserDirectory;
    use crate::live_cache::EntryStatus;
    use crate::session::Backends;
    use crate::subscriptions::tests::fields;
    use crate::subscriptions::SubscriptionManager;

    #[test]
    fn test_update_fields_are_validated() {
        let fields = ProfileUpdate::new()
            .display_name("  Grace ")
            .avatar_url("https://x/g.png")
            .to_fields()
            .unwrap();
        assert_eq!(fields["displayName"], Value::from("Grace"));
        assert_eq!(fields["photoURL"], Value::from("https://x/g.png"));

        let only_name = ProfileUpdate::new().display_name("Grace").to_fields().unwrap();
        assert!(!only_name.contains_key("photoURL"));

        for update in [
            ProfileUpdate::new(),
            ProfileUpdate::new().display_name("   "),
            ProfileUpdate::new().avatar_url(""),
        ] {
            assert!(matches!(update.to_fields(), Err(ClientError::InvalidProfile(_))));
        }
    }

    #[tokio::test]
    async fn test_resolved_profile_observes_own_edit() {
        let backend = MemoryBackend::new();
        backend.put_document(
            "users",
            "u1",
            fields(serde_json::json!({"displayName": "Ada", "email": "ada@example.com"})),
        );
        let backends = Backends::memory(backend.clone(), Arc::new(MemoryObjectStore::new("mem://")));
        let config = ClientConfig::default();
        let directory = UserDirectory::new(
            SubscriptionManager::new(&backends, &config),
            config.profile_defaults.clone(),
        );
        let session = SessionContext::new(UserId::from("u1"));

        let mut handle = directory.resolve(&session.user);
        assert_eq!(handle.settled().await, EntryStatus::Live);
        assert_eq!(handle.get().display_name, "Ada");

        let update = ProfileUpdate::new()
            .display_name("Grace")
            .avatar_url("https://x/g.png");
        update_own_profile(backends.documents.as_ref(), "users", &session, &update)
            .await
            .unwrap();

        let updated = handle.changed().await.unwrap();
        assert_eq!(updated.display_name, "Grace");
        assert_eq!(updated.avatar_url, "https://x/g.png");
        // Merge keeps fields the update did not name.
        assert_eq!(updated.email.as_deref(), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn test_rejected_write_is_reported() {
        let backend = MemoryBackend::new();
        backend.fail_writes(Some("offline"));
        let session = SessionContext::new(UserId::from("u1"));
        let update = ProfileUpdate::new().display_name("Grace");

        let result = update_own_profile(&backend, "users", &session, &update).await;
        assert!(matches!(result, Err(ClientError::Store(_))));
        assert!(backend.get("users", "u1").await.unwrap().is_none());
    }
}
