use serde::Serialize;
use tokio::sync::mpsc;

use murmur_shared::{Message, UserId};

use crate::scroll::ScrollDecision;

pub const EVENT_MESSAGES_UPDATED: &str = "messages-updated";
pub const EVENT_SCROLL: &str = "scroll";
pub const EVENT_NEW_CONTENT_BELOW: &str = "new-content-below";
pub const EVENT_PROFILES_REQUESTED: &str = "profiles-requested";
pub const EVENT_FEED_CLOSED: &str = "feed-closed";

#[derive(Debug, Clone, Serialize)]
pub struct MessagesPayload {
    pub messages: Vec<Message>,
    /// Entries of the batch dropped as malformed.
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfilesPayload {
    pub users: Vec<UserId>,
}

/// Notifications pushed from the core to the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ChatEvent {
    MessagesUpdated(MessagesPayload),
    Scroll(ScrollDecision),
    NewContentBelow { visible: bool },
    ProfilesRequested(ProfilesPayload),
    /// The feed subscription ended; the caller decides whether to reopen.
    FeedClosed { reason: String },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessagesUpdated(_) => EVENT_MESSAGES_UPDATED,
            Self::Scroll(_) => EVENT_SCROLL,
            Self::NewContentBelow { .. } => EVENT_NEW_CONTENT_BELOW,
            Self::ProfilesRequested(_) => EVENT_PROFILES_REQUESTED,
            Self::FeedClosed { .. } => EVENT_FEED_CLOSED,
        }
    }
}

pub fn emit_event(tx: &mpsc::UnboundedSender<ChatEvent>, event: ChatEvent) {
    let name = event.name();
    if tx.send(event).is_err() {
        tracing::warn!(event = name, "Event receiver dropped");
    }
}
