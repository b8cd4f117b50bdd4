//! # murmur-client
//!
//! Local synchronization core of the murmur chat client: keyed live
//! subscriptions, message reconciliation, the profile directory, presence,
//! scroll anchoring and sequential media upload, wired together by
//! [`ChatSession`].

pub mod chat;
pub mod config;
pub mod directory;
pub mod drafts;
pub mod error;
pub mod events;
pub mod gallery;
pub mod live_cache;
pub mod presence;
pub mod profile;
pub mod reconciler;
pub mod scroll;
pub mod session;
pub mod subscriptions;
pub mod upload;

use tracing_subscriber::{fmt, EnvFilter};

pub use chat::ChatSession;
pub use config::ClientConfig;
pub use directory::{ProfileHandle, UserDirectory};
pub use drafts::{DraftStatus, DraftTray, MediaDraft};
pub use error::{ClientError, Result};
pub use events::ChatEvent;
pub use gallery::{GalleryItem, MediaGallery};
pub use live_cache::EntryStatus;
pub use presence::{
    HeartbeatGuard, LifecycleEvent, PresenceHandle, PresenceState, PresenceTracker,
    RemotePresence, Transition, WriteOutcome,
};
pub use profile::ProfileUpdate;
pub use reconciler::{AuthorLookup, MessageReconciler, Reconciled};
pub use scroll::{ScrollAnchor, ScrollBehavior, ScrollDecision, Viewport};
pub use session::{Backends, SessionContext};
pub use subscriptions::{Subscription, SubscriptionKey, SubscriptionManager};
pub use upload::{ItemOutcome, MediaUploadPipeline, SendReport};

/// Install the global fmt subscriber. `RUST_LOG` overrides the default
/// filter. Returns `false` when a subscriber was already installed.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("murmur_client=debug,murmur_store=info,murmur_shared=info,warn")
    });

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(app = murmur_shared::constants::APP_NAME, "Tracing initialised");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_installs_once() {
        init_tracing();
        assert!(!init_tracing());
    }
}
