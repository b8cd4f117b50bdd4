//! Sequential store-then-publish of staged media.
//!
//! Each draft is stored and its message appended before the next draft is
//! touched, so feed order matches tray order. The first failure stops the
//! run; earlier items stay published. Draft status records how far each
//! item got, so sending the same drafts again skips completed work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use murmur_shared::constants::CREATED_AT_FIELD;
use murmur_shared::{MediaRef, MessageId, OutgoingMessage, UserId};
use murmur_store::{LiveQueryFeed, ObjectStorage};

use crate::config::ClientConfig;
use crate::drafts::{DraftStatus, MediaDraft};
use crate::error::{ClientError, Result};
use crate::session::{Backends, SessionContext};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Sent { message_id: MessageId },
    /// Sent by an earlier call; skipped.
    AlreadySent { message_id: MessageId },
    Failed { reason: String },
    /// Not tried because an earlier item failed.
    NotAttempted,
}

/// Per-item outcomes, index-aligned with the drafts passed to `send`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SendReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl SendReport {
    pub fn failed_indices(&self) -> Vec<usize> {
        self.indices(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    /// Items a caller may resubmit: failed and not attempted.
    pub fn retryable(&self) -> Vec<usize> {
        self.indices(|o| matches!(o, ItemOutcome::Failed { .. } | ItemOutcome::NotAttempted))
    }

    pub fn sent_count(&self) -> usize {
        self.indices(|o| matches!(o, ItemOutcome::Sent { .. })).len()
    }

    pub fn is_complete(&self) -> bool {
        self.retryable().is_empty()
    }

    fn indices(&self, pred: impl Fn(&ItemOutcome) -> bool) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| pred(o))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Clears the in-progress flag on every exit path.
struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ClientError::SendInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct MediaUploadPipeline {
    author: UserId,
    feed: Arc<dyn LiveQueryFeed>,
    objects: Arc<dyn ObjectStorage>,
    messages_collection: String,
    media_prefix: String,
    busy: Arc<AtomicBool>,
}

impl MediaUploadPipeline {
    pub fn new(session: &SessionContext, backends: &Backends, config: &ClientConfig) -> Self {
        Self {
            author: session.user.clone(),
            feed: backends.feed.clone(),
            objects: backends.objects.clone(),
            messages_collection: config.messages_collection.clone(),
            media_prefix: config.media_prefix.clone(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Send `drafts` in order. Fails only when another send is running;
    /// per-item failures are reported in the [`SendReport`].
    pub async fn send(&self, drafts: &mut [MediaDraft]) -> Result<SendReport> {
        let _busy = Busy::acquire(&self.busy)?;

        let mut outcomes = Vec::with_capacity(drafts.len());
        let mut halted = false;

        for (index, draft) in drafts.iter_mut().enumerate() {
            if let DraftStatus::Sent { message_id } = &draft.status {
                outcomes.push(ItemOutcome::AlreadySent {
                    message_id: message_id.clone(),
                });
                continue;
            }
            if halted {
                outcomes.push(ItemOutcome::NotAttempted);
                continue;
            }

            match self.send_one(draft).await {
                Ok(message_id) => {
                    draft.status = DraftStatus::Sent {
                        message_id: message_id.clone(),
                    };
                    outcomes.push(ItemOutcome::Sent { message_id });
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(index, file = %draft.file_name, error = %reason, "Media send failed");
                    draft.status = DraftStatus::Failed {
                        reason: reason.clone(),
                    };
                    outcomes.push(ItemOutcome::Failed { reason });
                    halted = true;
                }
            }
        }

        let report = SendReport { outcomes };
        info!(
            total = drafts.len(),
            sent = report.sent_count(),
            retryable = report.retryable().len(),
            "Media send finished"
        );
        Ok(report)
    }

    async fn send_one(&self, draft: &mut MediaDraft) -> Result<MessageId> {
        let url = match &draft.stored_url {
            Some(url) => url.clone(),
            None => {
                let key = object_key(&self.media_prefix, &draft.file_name);
                let url = self
                    .objects
                    .put(&key, draft.content.clone(), &draft.content_type)
                    .await?;
                draft.stored_url = Some(url.clone());
                draft.status = DraftStatus::Stored { url: url.clone() };
                url
            }
        };

        let message = OutgoingMessage::media(
            self.author.clone(),
            MediaRef::new(url, draft.kind),
            draft.caption.trim(),
        );
        let id = self
            .feed
            .add(&self.messages_collection, message.to_fields(), Some(CREATED_AT_FIELD))
            .await?;
        Ok(MessageId::new(id))
    }
}

/// `{prefix}/{unix_millis}-{uuid8}-{file_name}`; fresh on every call.
fn object_key(prefix: &str, file_name: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}-{}-{}",
        prefix,
        Utc::now().timestamp_millis(),
        &nonce[..8],
        sanitize_file_name(file_name)
    )
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use murmur_shared::protocol::decode_message;
    use murmur_store::{MemoryBackend, MemoryObjectStore};
    use tokio::sync::Notify;

    use crate::drafts::DraftTray;

    fn setup() -> (MediaUploadPipeline, MemoryBackend, MemoryObjectStore) {
        let backend = MemoryBackend::new();
        let objects = MemoryObjectStore::new("https://cdn.test");
        let backends = Backends::memory(backend.clone(), Arc::new(objects.clone()));
        let session = SessionContext::new(UserId::from("u1"));
        let pipeline = MediaUploadPipeline::new(&session, &backends, &ClientConfig::default());
        (pipeline, backend, objects)
    }

    fn tray(names: &[&str]) -> DraftTray {
        let mut tray = DraftTray::new(1024);
        for (i, name) in names.iter().enumerate() {
            tray.stage(*name, "image/png", Bytes::from_static(b"png"), None)
                .unwrap();
            tray.set_caption(i, format!("caption {name}")).unwrap();
        }
        tray
    }

    /// Captions in feed order, oldest first.
    fn feed_captions(backend: &MemoryBackend) -> Vec<String> {
        backend
            .documents("messages", CREATED_AT_FIELD)
            .iter()
            .rev()
            .map(|doc| decode_message(doc).unwrap().caption.unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn test_partial_failure_then_retry_without_duplicates() {
        let (pipeline, backend, objects) = setup();
        let mut tray = tray(&["a.png", "b.png", "c.png"]);
        objects.fail_keys_containing("b.png");

        let report = pipeline.send(tray.drafts_mut()).await.unwrap();
        assert!(matches!(report.outcomes[0], ItemOutcome::Sent { .. }));
        assert!(matches!(report.outcomes[1], ItemOutcome::Failed { .. }));
        assert_eq!(report.outcomes[2], ItemOutcome::NotAttempted);
        assert_eq!(report.failed_indices(), vec![1]);
        assert_eq!(report.retryable(), vec![1, 2]);
        assert_eq!(feed_captions(&backend), vec!["caption a.png"]);
        assert!(tray.get(1).unwrap().is_failed());

        objects.clear_failures();
        let report = pipeline.send(tray.drafts_mut()).await.unwrap();
        assert!(matches!(report.outcomes[0], ItemOutcome::AlreadySent { .. }));
        assert!(report.is_complete());
        assert_eq!(
            feed_captions(&backend),
            vec!["caption a.png", "caption b.png", "caption c.png"]
        );
        assert_eq!(tray.clear_sent(), 3);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_reupload() {
        let (pipeline, backend, objects) = setup();
        let mut tray = tray(&["a.png"]);
        backend.fail_writes(Some("feed unavailable"));

        let report = pipeline.send(tray.drafts_mut()).await.unwrap();
        assert_eq!(report.failed_indices(), vec![0]);
        assert!(tray.get(0).unwrap().stored_url.is_some());
        assert_eq!(objects.put_calls(), 1);

        backend.fail_writes(None);
        let report = pipeline.send(tray.drafts_mut()).await.unwrap();
        assert_eq!(report.sent_count(), 1);
        assert_eq!(objects.put_calls(), 1);
    }

    #[tokio::test]
    async fn test_published_message_carries_media_and_caption() {
        let (pipeline, backend, objects) = setup();
        let mut drafts = DraftTray::new(1024);
        drafts
            .stage("clip.mp4", "video/mp4", Bytes::from_static(b"mp4"), None)
            .unwrap();
        drafts.set_caption(0, "  hello  ").unwrap();

        pipeline.send(drafts.drafts_mut()).await.unwrap();

        let docs = backend.documents("messages", CREATED_AT_FIELD);
        let message = decode_message(&docs[0]).unwrap();
        let media = message.media.unwrap();
        assert_eq!(media.kind, murmur_shared::MediaKind::Video);
        assert!(media.url.starts_with("https://cdn.test/chat-media/"));
        assert_eq!(message.caption.as_deref(), Some("hello"));
        assert_eq!(message.author, UserId::from("u1"));
        assert!(objects.keys()[0].ends_with("-clip.mp4"));
    }

    /// Object store that blocks uploads until released.
    #[derive(Default)]
    struct GatedObjects {
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl ObjectStorage for GatedObjects {
        async fn put(&self, key: &str, _data: Bytes, _content_type: &str) -> murmur_store::Result<String> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(format!("mem://{key}"))
        }
    }

    #[tokio::test]
    async fn test_concurrent_send_is_refused() {
        let backend = MemoryBackend::new();
        let objects = Arc::new(GatedObjects::default());
        let backends = Backends::memory(backend, objects.clone());
        let session = SessionContext::new(UserId::from("u1"));
        let pipeline = MediaUploadPipeline::new(&session, &backends, &ClientConfig::default());

        let mut first = tray(&["a.png"]);
        let running = pipeline.clone();
        let task = tokio::spawn(async move { running.send(first.drafts_mut()).await.map(|r| r.sent_count()) });

        objects.entered.notified().await;
        assert!(pipeline.is_busy());
        let mut second = tray(&["b.png"]);
        assert!(matches!(
            pipeline.send(second.drafts_mut()).await,
            Err(ClientError::SendInProgress)
        ));

        objects.gate.notify_one();
        assert_eq!(task.await.unwrap().unwrap(), 1);
        assert!(!pipeline.is_busy());
    }

    #[test]
    fn test_object_keys_are_unique_and_safe() {
        let a = object_key("chat-media", "../../etc/passwd");
        let b = object_key("chat-media", "../../etc/passwd");
        assert_ne!(a, b);
        assert!(a.starts_with("chat-media/"));
        assert_eq!(a.matches('/').count(), 1);
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name("my photo.png"), "my_photo.png");
    }
}
