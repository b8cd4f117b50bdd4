//! Store documents and the validated change batches decoded from them.
//!
//! Documents arrive from the remote store as untyped JSON field maps. They
//! are decoded into tagged [`Payload`]s exactly once, when a batch crosses
//! the subscription boundary; entries that fail validation are dropped there
//! and never reach the reconciler or the caches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::constants::{CREATED_AT_FIELD, LAST_SEEN_FIELD};
use crate::error::ValidationError;
use crate::models::{
    MediaRef, Message, OutgoingMessage, PresenceRecord, ProfileDefaults, UserProfile,
};
use crate::types::{MediaKind, MessageId, UserId};

/// Untyped document body.
pub type Fields = serde_json::Map<String, Value>;

/// A document as delivered by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// One raw change reported by a store listener.
#[derive(Debug, Clone, PartialEq)]
pub enum DocChange {
    Added(Document),
    Modified(Document),
    Removed { id: String },
}

impl DocChange {
    pub fn id(&self) -> &str {
        match self {
            Self::Added(doc) | Self::Modified(doc) => &doc.id,
            Self::Removed { id } => id,
        }
    }
}

// ---------------------------------------------------------------------------
// Validated batches
// ---------------------------------------------------------------------------

/// Which payload type a subscription carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Message,
    Profile,
    Presence,
}

/// A decoded, validated document body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Message(Message),
    Profile(UserProfile),
    Presence(PresenceRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert(Payload),
    Tombstone,
}

/// An instruction to apply to the entry identified by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub id: String,
    pub change: Change,
}

impl ChangeEntry {
    pub fn upsert(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            change: Change::Upsert(payload),
        }
    }

    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            change: Change::Tombstone,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.change {
            Change::Upsert(payload) => Some(payload),
            Change::Tombstone => None,
        }
    }
}

/// Ordered sequence of entries delivered by one subscription callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub entries: Vec<ChangeEntry>,
    /// Number of raw changes dropped because they failed validation.
    pub rejected: usize,
}

impl ChangeBatch {
    pub fn new(entries: Vec<ChangeEntry>) -> Self {
        Self {
            entries,
            rejected: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeEntry> {
        self.entries.iter()
    }
}

/// Decode a raw listener callback into a validated batch.
///
/// Order is preserved. Malformed entries are logged and skipped; the rest
/// of the batch is still returned.
pub fn decode_batch(
    kind: PayloadKind,
    changes: Vec<DocChange>,
    defaults: &ProfileDefaults,
) -> ChangeBatch {
    let mut batch = ChangeBatch::default();
    for change in changes {
        let doc = match change {
            DocChange::Removed { id } => {
                batch.entries.push(ChangeEntry::tombstone(id));
                continue;
            }
            DocChange::Added(doc) | DocChange::Modified(doc) => doc,
        };

        let decoded = match kind {
            PayloadKind::Message => decode_message(&doc).map(Payload::Message),
            PayloadKind::Profile => decode_profile(&doc, defaults).map(Payload::Profile),
            PayloadKind::Presence => decode_presence(&doc).map(Payload::Presence),
        };

        match decoded {
            Ok(payload) => batch.entries.push(ChangeEntry::upsert(doc.id, payload)),
            Err(e) => {
                warn!(id = %doc.id, kind = ?kind, error = %e, "Dropping malformed entry");
                batch.rejected += 1;
            }
        }
    }
    batch
}

// ---------------------------------------------------------------------------
// Per-collection decoders
// ---------------------------------------------------------------------------

pub fn decode_message(doc: &Document) -> Result<Message, ValidationError> {
    let f = &doc.fields;

    let author = match f.get("uid").and_then(Value::as_str) {
        Some(uid) if !uid.trim().is_empty() => UserId::new(uid),
        _ => return Err(ValidationError::MissingField("uid")),
    };

    let text = optional_str(f, "text").unwrap_or_default();
    let created_at = decode_timestamp(CREATED_AT_FIELD, f.get(CREATED_AT_FIELD))?;

    let media = match optional_str(f, "mediaUrl") {
        Some(url) => {
            let kind = match optional_str(f, "mediaType") {
                Some(t) => MediaKind::parse(&t).ok_or_else(|| ValidationError::InvalidField {
                    field: "mediaType",
                    reason: format!("unknown media type {t:?}"),
                })?,
                None => MediaKind::Image,
            };
            Some(MediaRef {
                url,
                kind,
                thumbnail_url: optional_str(f, "thumbnailUrl"),
                duration_secs: f.get("videoDuration").and_then(Value::as_f64),
            })
        }
        // Legacy single-image messages.
        None => optional_str(f, "imageUrl").map(|url| MediaRef::new(url, MediaKind::Image)),
    };

    let caption = optional_str(f, "caption").or_else(|| {
        if media.is_some() && !text.is_empty() {
            Some(text.clone())
        } else {
            None
        }
    });

    Ok(Message {
        id: MessageId::new(doc.id.clone()),
        author,
        text,
        media,
        caption,
        created_at,
    })
}

pub fn decode_profile(
    doc: &Document,
    defaults: &ProfileDefaults,
) -> Result<UserProfile, ValidationError> {
    let f = &doc.fields;
    if doc.id.trim().is_empty() {
        return Err(ValidationError::MissingField("id"));
    }

    let last_seen = decode_timestamp(LAST_SEEN_FIELD, f.get(LAST_SEEN_FIELD)).unwrap_or_else(|e| {
        warn!(user = %doc.id, error = %e, "Ignoring unreadable lastSeen");
        None
    });

    Ok(UserProfile {
        id: UserId::new(doc.id.clone()),
        display_name: optional_str(f, "displayName")
            .unwrap_or_else(|| defaults.display_name.clone()),
        avatar_url: optional_str(f, "photoURL").unwrap_or_else(|| defaults.avatar_url.clone()),
        email: optional_str(f, "email"),
        online: f.get("online").and_then(Value::as_bool).unwrap_or(false),
        last_seen,
    })
}

pub fn decode_presence(doc: &Document) -> Result<PresenceRecord, ValidationError> {
    let f = &doc.fields;
    if doc.id.trim().is_empty() {
        return Err(ValidationError::MissingField("id"));
    }

    let online = match f.get("online") {
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(ValidationError::InvalidField {
                field: "online",
                reason: format!("expected bool, got {other}"),
            })
        }
        None => return Err(ValidationError::MissingField("online")),
    };

    Ok(PresenceRecord {
        user: UserId::new(doc.id.clone()),
        online,
        last_seen: decode_timestamp(LAST_SEEN_FIELD, f.get(LAST_SEEN_FIELD))?,
        session_id: optional_str(f, "sessionId"),
    })
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

impl OutgoingMessage {
    /// Document body for the feed. `createdAt` is stamped by the store.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("uid".into(), json!(self.author.as_str()));
        fields.insert("text".into(), json!(self.text));
        if let Some(media) = &self.media {
            fields.insert("mediaUrl".into(), json!(media.url));
            fields.insert("mediaType".into(), json!(media.kind.as_str()));
            if let Some(thumb) = &media.thumbnail_url {
                fields.insert("thumbnailUrl".into(), json!(thumb));
            }
            if let Some(duration) = media.duration_secs {
                fields.insert("videoDuration".into(), json!(duration));
            }
        }
        if let Some(caption) = &self.caption {
            fields.insert("caption".into(), json!(caption));
        }
        fields
    }
}

impl PresenceRecord {
    /// Document body for the presence collection. `lastSeen` is stamped by the store.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("online".into(), json!(self.online));
        if let Some(session) = &self.session_id {
            fields.insert("sessionId".into(), json!(session));
        }
        fields
    }
}

/// Wire form of a timestamp: `{ "seconds": i64, "nanoseconds": u32 }`.
pub fn encode_timestamp(ts: DateTime<Utc>) -> Value {
    json!({
        "seconds": ts.timestamp(),
        "nanoseconds": ts.timestamp_subsec_nanos(),
    })
}

/// Decode a nullable timestamp field.
///
/// Accepts `null`, `{seconds, nanoseconds}` objects and RFC 3339 strings.
pub fn decode_timestamp(
    field: &'static str,
    value: Option<&Value>,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField { field, reason };

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => {
            let secs = map
                .get("seconds")
                .and_then(Value::as_i64)
                .ok_or_else(|| invalid("missing seconds".into()))?;
            let nanos = map.get("nanoseconds").and_then(Value::as_u64).unwrap_or(0);
            let nanos = u32::try_from(nanos).map_err(|_| invalid("nanoseconds out of range".into()))?;
            DateTime::from_timestamp(secs, nanos)
                .map(Some)
                .ok_or_else(|| invalid("timestamp out of range".into()))
        }
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| invalid(e.to_string())),
        Some(other) => Err(invalid(format!("unexpected value {other}"))),
    }
}

fn optional_str(fields: &Fields, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, value: Value) -> Document {
        match value {
            Value::Object(fields) => Document::new(id, fields),
            _ => panic!("fields must be an object"),
        }
    }

    #[test]
    fn test_decode_text_message() {
        let d = doc(
            "m1",
            json!({"uid": "u1", "text": "hi", "createdAt": {"seconds": 1_700_000_000, "nanoseconds": 5}}),
        );
        let m = decode_message(&d).unwrap();
        assert_eq!(m.id, MessageId::from("m1"));
        assert_eq!(m.author, UserId::from("u1"));
        assert_eq!(m.text, "hi");
        assert!(m.media.is_none());
        assert_eq!(m.created_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_decode_pending_message() {
        let d = doc("m1", json!({"uid": "u1", "text": "hi", "createdAt": null}));
        assert!(decode_message(&d).unwrap().is_pending());
    }

    #[test]
    fn test_missing_author_rejected() {
        let d = doc("m1", json!({"text": "orphan"}));
        assert_eq!(
            decode_message(&d).unwrap_err(),
            ValidationError::MissingField("uid")
        );
        let d = doc("m2", json!({"uid": "  ", "text": "blank"}));
        assert!(decode_message(&d).is_err());
    }

    #[test]
    fn test_decode_media_and_legacy_image() {
        let d = doc(
            "m1",
            json!({"uid": "u1", "text": "look", "mediaUrl": "https://x/v.mp4", "mediaType": "video", "videoDuration": 3.5}),
        );
        let m = decode_message(&d).unwrap();
        let media = m.media.unwrap();
        assert_eq!(media.kind, MediaKind::Video);
        assert_eq!(media.duration_secs, Some(3.5));
        assert_eq!(m.caption.as_deref(), Some("look"));

        let d = doc("m2", json!({"uid": "u1", "text": "", "imageUrl": "https://x/a.png"}));
        let m = decode_message(&d).unwrap();
        assert_eq!(m.media.unwrap().kind, MediaKind::Image);
        assert_eq!(m.caption, None);
    }

    #[test]
    fn test_unknown_media_type_rejected() {
        let d = doc("m1", json!({"uid": "u1", "mediaUrl": "x", "mediaType": "audio"}));
        assert!(decode_message(&d).is_err());
    }

    #[test]
    fn test_profile_defaults_fill_absent_fields() {
        let defaults = ProfileDefaults::default();
        let d = doc("u1", json!({"email": "a@b.c", "lastSeen": "2024-01-01T00:00:00Z"}));
        let p = decode_profile(&d, &defaults).unwrap();
        assert_eq!(p.display_name, defaults.display_name);
        assert_eq!(p.avatar_url, defaults.avatar_url);
        assert_eq!(p.email.as_deref(), Some("a@b.c"));
        assert!(!p.online);
        assert!(p.last_seen.is_some());
    }

    #[test]
    fn test_presence_requires_online_flag() {
        assert!(decode_presence(&doc("u1", json!({"lastSeen": null}))).is_err());
        let p = decode_presence(&doc("u1", json!({"online": true, "sessionId": "s"}))).unwrap();
        assert!(p.online);
        assert_eq!(p.session_id.as_deref(), Some("s"));
    }

    #[test]
    fn test_decode_batch_skips_malformed_and_keeps_order() {
        let changes = vec![
            DocChange::Added(doc("m3", json!({"uid": "u1", "text": "c"}))),
            DocChange::Added(doc("bad", json!({"text": "no author"}))),
            DocChange::Removed { id: "m0".into() },
            DocChange::Modified(doc("m1", json!({"uid": "u2", "text": "a"}))),
        ];
        let batch = decode_batch(PayloadKind::Message, changes, &ProfileDefaults::default());
        let ids: Vec<&str> = batch.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m0", "m1"]);
        assert_eq!(batch.rejected, 1);
        assert_eq!(batch.entries[1].change, Change::Tombstone);
    }

    #[test]
    fn test_timestamp_round_trip_through_wire_form() {
        let ts = DateTime::from_timestamp(1_700_000_123, 456).unwrap();
        let decoded = decode_timestamp("t", Some(&encode_timestamp(ts))).unwrap();
        assert_eq!(decoded, Some(ts));
        assert!(decode_timestamp("t", Some(&json!(42))).is_err());
    }

    #[test]
    fn test_outgoing_media_fields() {
        let out = OutgoingMessage::media(
            UserId::from("u1"),
            MediaRef::new("https://x/a.png", MediaKind::Image),
            "caption",
        );
        let fields = out.to_fields();
        assert_eq!(fields["mediaType"], json!("image"));
        assert_eq!(fields["caption"], json!("caption"));
        assert_eq!(fields["text"], json!("caption"));
        assert!(!fields.contains_key(CREATED_AT_FIELD));
    }
}
