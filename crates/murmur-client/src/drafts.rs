//! Compose-side staging of media before it is sent.

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_shared::{MediaKind, MessageId};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DraftStatus {
    Staged,
    /// Content is in object storage; the message is not published yet.
    Stored { url: String },
    Sent { message_id: MessageId },
    Failed { reason: String },
}

/// A locally staged media item.
#[derive(Debug, Clone)]
pub struct MediaDraft {
    pub id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub content: Bytes,
    /// Locally rendered preview (an object URL or a thumbnail path).
    pub preview: Option<String>,
    pub kind: MediaKind,
    pub caption: String,
    pub status: DraftStatus,
    /// Set once the content is stored, so a retry only publishes.
    pub stored_url: Option<String>,
}

impl MediaDraft {
    pub fn is_sent(&self) -> bool {
        matches!(self.status, DraftStatus::Sent { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DraftStatus::Failed { .. })
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Ordered set of drafts owned by the compose flow.
#[derive(Debug, Clone)]
pub struct DraftTray {
    drafts: Vec<MediaDraft>,
    max_bytes: usize,
}

impl DraftTray {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            drafts: Vec::new(),
            max_bytes,
        }
    }

    /// Stage a file. Only `image/*` and `video/*` content is accepted.
    pub fn stage(
        &mut self,
        file_name: impl Into<String>,
        content_type: &str,
        content: Bytes,
        preview: Option<String>,
    ) -> Result<Uuid> {
        let file_name = file_name.into();
        let kind = MediaKind::from_mime(content_type)
            .ok_or_else(|| ClientError::UnsupportedMedia(content_type.to_string()))?;
        if content.is_empty() {
            return Err(ClientError::EmptyMedia(file_name));
        }
        if content.len() > self.max_bytes {
            return Err(ClientError::MediaTooLarge {
                size: content.len(),
                max: self.max_bytes,
            });
        }

        let id = Uuid::new_v4();
        debug!(draft = %id, file = %file_name, kind = %kind, size = content.len(), "Media staged");
        self.drafts.push(MediaDraft {
            id,
            file_name,
            content_type: content_type.to_string(),
            content,
            preview,
            kind,
            caption: String::new(),
            status: DraftStatus::Staged,
            stored_url: None,
        });
        Ok(id)
    }

    pub fn set_caption(&mut self, index: usize, caption: impl Into<String>) -> Result<()> {
        self.get_mut(index)?.caption = caption.into();
        Ok(())
    }

    /// Append text (an emoji pick, typically) to a caption.
    pub fn append_to_caption(&mut self, index: usize, text: &str) -> Result<()> {
        self.get_mut(index)?.caption.push_str(text);
        Ok(())
    }

    /// Move the draft at `from` so it ends up at `to`.
    pub fn move_item(&mut self, from: usize, to: usize) -> Result<()> {
        if from >= self.drafts.len() {
            return Err(ClientError::DraftNotFound(from));
        }
        if to >= self.drafts.len() {
            return Err(ClientError::DraftNotFound(to));
        }
        let draft = self.drafts.remove(from);
        self.drafts.insert(to, draft);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<MediaDraft> {
        if index >= self.drafts.len() {
            return Err(ClientError::DraftNotFound(index));
        }
        Ok(self.drafts.remove(index))
    }

    /// Discard everything.
    pub fn cancel(&mut self) -> Vec<MediaDraft> {
        if !self.drafts.is_empty() {
            info!(count = self.drafts.len(), "Media drafts discarded");
        }
        std::mem::take(&mut self.drafts)
    }

    /// Drop drafts that were sent; failed and unsent ones stay.
    pub fn clear_sent(&mut self) -> usize {
        let before = self.drafts.len();
        self.drafts.retain(|d| !d.is_sent());
        before - self.drafts.len()
    }

    pub fn drafts(&self) -> &[MediaDraft] {
        &self.drafts
    }

    pub fn drafts_mut(&mut self) -> &mut [MediaDraft] {
        &mut self.drafts
    }

    pub fn get(&self, index: usize) -> Option<&MediaDraft> {
        self.drafts.get(index)
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut MediaDraft> {
        self.drafts
            .get_mut(index)
            .ok_or(ClientError::DraftNotFound(index))
    }

    pub fn failed(&self) -> Vec<usize> {
        self.indices(MediaDraft::is_failed)
    }

    pub fn unsent(&self) -> Vec<usize> {
        self.indices(|d| !d.is_sent())
    }

    fn indices(&self, pred: impl Fn(&MediaDraft) -> bool) -> Vec<usize> {
        self.drafts
            .iter()
            .enumerate()
            .filter(|(_, d)| pred(d))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}
