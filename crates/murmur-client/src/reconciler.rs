//! Ordered, deduplicated message window.
//!
//! The feed delivers its window newest first. Batches are applied in
//! reverse so that new entries land in ascending order, then merged by id:
//! an existing entry is replaced in place (a pending message becomes its
//! acknowledged self), a tombstone removes it. The list is kept sorted by
//! creation time with unacknowledged messages last; equal timestamps keep
//! the order in which the entries were merged.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use murmur_shared::protocol::{Change, ChangeBatch, Payload};
use murmur_shared::{Message, MessageId, UserId};

/// Answers whether an author's profile is already being tracked.
pub trait AuthorLookup {
    fn is_known(&self, user: &UserId) -> bool;
}

/// Lookup that knows no one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthors;

impl AuthorLookup for NoAuthors {
    fn is_known(&self, _user: &UserId) -> bool {
        false
    }
}

impl AuthorLookup for HashSet<UserId> {
    fn is_known(&self, user: &UserId) -> bool {
        self.contains(user)
    }
}

/// Result of applying one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciled {
    /// The window after the merge, oldest first.
    pub messages: Vec<Message>,
    /// Authors present in the window whose profiles are not tracked yet,
    /// in order of first appearance.
    pub new_authors: Vec<UserId>,
    /// Whether the window differs from before the batch.
    pub changed: bool,
}

/// Owner of the local message list.
#[derive(Debug, Clone)]
pub struct MessageReconciler {
    window: usize,
    messages: Vec<Message>,
}

impl MessageReconciler {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            messages: Vec::new(),
        }
    }

    pub fn apply(&mut self, batch: &ChangeBatch, authors: &impl AuthorLookup) -> Reconciled {
        let before = self.messages.clone();

        for entry in batch.iter().rev() {
            match &entry.change {
                Change::Tombstone => self.messages.retain(|m| m.id.as_str() != entry.id),
                Change::Upsert(Payload::Message(message)) => {
                    match self.messages.iter_mut().find(|m| m.id.as_str() == entry.id) {
                        Some(existing) => *existing = message.clone(),
                        None => self.messages.push(message.clone()),
                    }
                }
                Change::Upsert(_) => {
                    debug!(id = %entry.id, "Ignoring non-message payload in feed batch");
                }
            }
        }

        self.messages
            .sort_by(|a, b| by_creation(a.created_at, b.created_at));

        if self.messages.len() > self.window {
            let excess = self.messages.len() - self.window;
            self.messages.drain(..excess);
        }

        let mut new_authors: Vec<UserId> = Vec::new();
        for message in &self.messages {
            if !authors.is_known(&message.author) && !new_authors.contains(&message.author) {
                new_authors.push(message.author.clone());
            }
        }

        let changed = self.messages != before;
        debug!(
            entries = batch.len(),
            window = self.messages.len(),
            new_authors = new_authors.len(),
            changed,
            "Feed batch reconciled"
        );

        Reconciled {
            messages: self.messages.clone(),
            new_authors,
            changed,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Ascending by timestamp; unacknowledged (`None`) sorts last.
fn by_creation(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::protocol::ChangeEntry;
    use murmur_shared::{ProfileDefaults, UserProfile};

    fn msg(id: &str, author: &str, secs: Option<i64>) -> Message {
        Message {
            id: MessageId::from(id),
            author: UserId::from(author),
            text: format!("text of {id}"),
            media: None,
            caption: None,
            created_at: secs.and_then(|s| DateTime::from_timestamp(s, 0)),
        }
    }

    fn upsert(m: Message) -> ChangeEntry {
        ChangeEntry::upsert(m.id.as_str().to_string(), Payload::Message(m))
    }

    fn ids(r: &MessageReconciler) -> Vec<&str> {
        r.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_initial_descending_batch_is_inverted() {
        let mut r = MessageReconciler::new(50);
        let batch = ChangeBatch::new(vec![
            upsert(msg("m3", "u1", Some(30))),
            upsert(msg("m2", "u2", Some(20))),
            upsert(msg("m1", "u1", Some(10))),
        ]);
        let out = r.apply(&batch, &NoAuthors);
        assert_eq!(ids(&r), vec!["m1", "m2", "m3"]);
        assert_eq!(out.new_authors, vec![UserId::from("u1"), UserId::from("u2")]);
        assert!(out.changed);
    }

    #[test]
    fn test_applying_same_batch_twice_is_idempotent() {
        let mut r = MessageReconciler::new(50);
        let batch = ChangeBatch::new(vec![
            upsert(msg("m2", "u1", Some(20))),
            upsert(msg("m1", "u1", Some(10))),
            ChangeEntry::tombstone("m0"),
        ]);
        let once = r.apply(&batch, &NoAuthors);
        let twice = r.apply(&batch, &NoAuthors);
        assert_eq!(once.messages, twice.messages);
        assert!(!twice.changed);
    }

    #[test]
    fn test_pending_message_is_reconciled_without_duplicate() {
        let mut r = MessageReconciler::new(50);
        r.apply(&ChangeBatch::new(vec![upsert(msg("m1", "u1", Some(10)))]), &NoAuthors);
        r.apply(&ChangeBatch::new(vec![upsert(msg("m2", "u1", None))]), &NoAuthors);
        assert!(r.last().unwrap().is_pending());

        r.apply(&ChangeBatch::new(vec![upsert(msg("m2", "u1", Some(20)))]), &NoAuthors);
        assert_eq!(ids(&r), vec!["m1", "m2"]);
        assert!(!r.last().unwrap().is_pending());
    }

    #[test]
    fn test_null_timestamp_sorts_last() {
        let mut r = MessageReconciler::new(50);
        let batch = ChangeBatch::new(vec![
            upsert(msg("pending", "u1", None)),
            upsert(msg("m2", "u1", Some(20))),
            upsert(msg("m1", "u1", Some(10))),
        ]);
        r.apply(&batch, &NoAuthors);
        assert_eq!(ids(&r), vec!["m1", "m2", "pending"]);
    }

    #[test]
    fn test_tombstone_removes_entry() {
        let mut r = MessageReconciler::new(50);
        r.apply(
            &ChangeBatch::new(vec![upsert(msg("m2", "u1", Some(20))), upsert(msg("m1", "u1", Some(10)))]),
            &NoAuthors,
        );
        let out = r.apply(&ChangeBatch::new(vec![ChangeEntry::tombstone("m1")]), &NoAuthors);
        assert_eq!(ids(&r), vec!["m2"]);
        assert!(out.changed);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut r = MessageReconciler::new(50);
        r.apply(
            &ChangeBatch::new(vec![upsert(msg("b", "u1", Some(5))), upsert(msg("a", "u1", Some(5)))]),
            &NoAuthors,
        );
        r.apply(&ChangeBatch::new(vec![upsert(msg("c", "u1", Some(5)))]), &NoAuthors);
        assert_eq!(ids(&r), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_window_keeps_newest() {
        let mut r = MessageReconciler::new(2);
        r.apply(
            &ChangeBatch::new(vec![
                upsert(msg("m3", "u3", Some(30))),
                upsert(msg("m2", "u2", Some(20))),
                upsert(msg("m1", "u1", Some(10))),
            ]),
            &NoAuthors,
        );
        assert_eq!(ids(&r), vec!["m2", "m3"]);
    }

    #[test]
    fn test_known_authors_are_not_reported() {
        let mut r = MessageReconciler::new(50);
        let known: HashSet<UserId> = [UserId::from("u1")].into_iter().collect();
        let out = r.apply(
            &ChangeBatch::new(vec![
                upsert(msg("m2", "u2", Some(20))),
                upsert(msg("m1", "u1", Some(10))),
            ]),
            &known,
        );
        assert_eq!(out.new_authors, vec![UserId::from("u2")]);
    }

    #[test]
    fn test_non_message_payloads_are_ignored() {
        let mut r = MessageReconciler::new(50);
        let profile = UserProfile::placeholder(UserId::from("u1"), &ProfileDefaults::default());
        let out = r.apply(
            &ChangeBatch::new(vec![ChangeEntry::upsert("u1", Payload::Profile(profile))]),
            &NoAuthors,
        );
        assert!(r.is_empty());
        assert!(!out.changed);
    }

    #[test]
    fn test_ids_unique_and_sorted_across_batches() {
        let mut r = MessageReconciler::new(50);
        let batches = vec![
            ChangeBatch::new(vec![upsert(msg("m5", "u1", Some(50))), upsert(msg("m1", "u1", Some(10)))]),
            ChangeBatch::new(vec![upsert(msg("m3", "u2", Some(30)))]),
            ChangeBatch::new(vec![upsert(msg("m1", "u1", Some(10))), upsert(msg("m4", "u1", None))]),
            ChangeBatch::new(vec![upsert(msg("m4", "u1", Some(40))), ChangeEntry::tombstone("m3")]),
        ];
        for batch in &batches {
            r.apply(batch, &NoAuthors);
            let mut seen = HashSet::new();
            assert!(r.messages().iter().all(|m| seen.insert(m.id.clone())));
            assert!(r
                .messages()
                .windows(2)
                .all(|w| by_creation(w[0].created_at, w[1].created_at) != Ordering::Greater));
        }
        assert_eq!(ids(&r), vec!["m1", "m4", "m5"]);
    }
}
