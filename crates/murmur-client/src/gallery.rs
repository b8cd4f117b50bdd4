use serde::Serialize;

use murmur_shared::{MediaKind, Message, MessageId, UserId};

/// One entry of the media carousel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryItem {
    pub message_id: MessageId,
    pub url: String,
    pub kind: MediaKind,
    pub caption: Option<String>,
    pub author: UserId,
}

/// Media carousel derived from the message window, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaGallery {
    items: Vec<GalleryItem>,
}

impl MediaGallery {
    pub fn from_messages(messages: &[Message]) -> Self {
        let items = messages
            .iter()
            .filter_map(|m| {
                let media = m.media.as_ref()?;
                Some(GalleryItem {
                    message_id: m.id.clone(),
                    url: media.url.clone(),
                    kind: media.kind,
                    caption: m.caption.clone().filter(|c| !c.trim().is_empty()),
                    author: m.author.clone(),
                })
            })
            .collect();
        Self { items }
    }

    pub fn items(&self) -> &[GalleryItem] {
        &self.items
    }

    /// Position of the item showing `url`, to open the carousel there.
    pub fn index_of(&self, url: &str) -> Option<usize> {
        self.items.iter().position(|item| item.url == url)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::MediaRef;

    fn message(id: &str, media: Option<(&str, MediaKind)>, caption: Option<&str>) -> Message {
        Message {
            id: MessageId::from(id),
            author: UserId::from("u1"),
            text: caption.unwrap_or_default().to_string(),
            media: media.map(|(url, kind)| MediaRef::new(url, kind)),
            caption: caption.map(str::to_string),
            created_at: None,
        }
    }

    #[test]
    fn test_gallery_skips_text_messages() {
        let messages = vec![
            message("m1", Some(("https://x/a.png", MediaKind::Image)), Some("first")),
            message("m2", None, Some("just text")),
            message("m3", Some(("https://x/b.mp4", MediaKind::Video)), Some("  ")),
        ];
        let gallery = MediaGallery::from_messages(&messages);

        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.items()[0].caption.as_deref(), Some("first"));
        assert_eq!(gallery.items()[1].kind, MediaKind::Video);
        assert_eq!(gallery.items()[1].caption, None);
        assert_eq!(gallery.index_of("https://x/b.mp4"), Some(1));
        assert_eq!(gallery.index_of("https://x/missing.png"), None);
    }
}
