//! Domain models reconciled by the synchronization core.
//!
//! Every struct derives `Serialize` so it can be handed directly to the UI
//! layer as an event payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_AVATAR_URL, DEFAULT_DISPLAY_NAME};
use crate::types::{MediaKind, MessageId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Stored media attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRef {
    /// Publicly resolvable URL returned by object storage.
    pub url: String,
    pub kind: MediaKind,
    pub thumbnail_url: Option<String>,
    /// Video length in seconds, when the sender recorded it.
    pub duration_secs: Option<f64>,
}

impl MediaRef {
    pub fn new(url: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            url: url.into(),
            kind,
            thumbnail_url: None,
            duration_secs: None,
        }
    }
}

/// A single chat message as seen in the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Store-assigned document id.
    pub id: MessageId,
    /// Identity of the sender.
    pub author: UserId,
    /// Message body (may be empty for media messages).
    pub text: String,
    pub media: Option<MediaRef>,
    pub caption: Option<String>,
    /// Server timestamp; `None` until the write is acknowledged.
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Whether the server has not yet acknowledged this message.
    pub fn is_pending(&self) -> bool {
        self.created_at.is_none()
    }
}

/// A message about to be appended to the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub author: UserId,
    pub text: String,
    pub media: Option<MediaRef>,
    pub caption: Option<String>,
}

impl OutgoingMessage {
    pub fn text(author: UserId, text: impl Into<String>) -> Self {
        Self {
            author,
            text: text.into(),
            media: None,
            caption: None,
        }
    }

    pub fn media(author: UserId, media: MediaRef, caption: impl Into<String>) -> Self {
        let caption = caption.into();
        Self {
            author,
            // Older clients render the caption from `text`.
            text: caption.clone(),
            media: Some(media),
            caption: if caption.is_empty() { None } else { Some(caption) },
        }
    }
}

// ---------------------------------------------------------------------------
// UserProfile
// ---------------------------------------------------------------------------

/// Values substituted for a profile that has not arrived or lacks fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDefaults {
    pub display_name: String,
    pub avatar_url: String,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            avatar_url: DEFAULT_AVATAR_URL.to_string(),
        }
    }
}

/// Public profile of a chat participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: String,
    /// Contact identifier (e-mail address).
    pub email: Option<String>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Profile shown while the real one is still loading.
    pub fn placeholder(id: UserId, defaults: &ProfileDefaults) -> Self {
        Self {
            id,
            display_name: defaults.display_name.clone(),
            avatar_url: defaults.avatar_url.clone(),
            email: None,
            online: false,
            last_seen: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// High-frequency online/offline signal for one identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceRecord {
    pub user: UserId,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    /// Session that performed the last write.
    pub session_id: Option<String>,
}

impl PresenceRecord {
    pub fn unknown(user: UserId) -> Self {
        Self {
            user,
            online: false,
            last_seen: None,
            session_id: None,
        }
    }
}
