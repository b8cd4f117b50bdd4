//! Keyed, reference-counted live subscriptions.
//!
//! Each [`SubscriptionKey`] maps to at most one upstream listener. Callers
//! receive a [`Subscription`] handle; all handles for a key share the
//! decoded batches of that one listener. The upstream listener is detached
//! when the last handle is released, when the key is force-closed, or when
//! the manager itself goes away.
//!
//! Raw store callbacks are decoded here, once, into validated
//! [`ChangeBatch`]es. Nothing downstream ever sees an untyped document.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_shared::protocol::{decode_batch, Change, ChangeBatch, ChangeEntry, Payload, PayloadKind};
use murmur_shared::{ProfileDefaults, UserId};
use murmur_store::{DocChange, DocumentStore, Listener, ListenerGuard, LiveQueryFeed};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::session::Backends;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// The newest-first message window.
    Feed,
    Profile(UserId),
    Presence(UserId),
}

impl SubscriptionKey {
    pub fn payload_kind(&self) -> PayloadKind {
        match self {
            Self::Feed => PayloadKind::Message,
            Self::Profile(_) => PayloadKind::Profile,
            Self::Presence(_) => PayloadKind::Presence,
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feed => f.write_str("feed"),
            Self::Profile(user) => write!(f, "profile:{user}"),
            Self::Presence(user) => write!(f, "presence:{user}"),
        }
    }
}

type Sink = mpsc::UnboundedSender<Arc<ChangeBatch>>;

/// Current state of a key, replayed to handles that join late.
#[derive(Default)]
struct Materialized {
    entries: Vec<(String, Payload)>,
}

impl Materialized {
    fn apply(&mut self, batch: &ChangeBatch) {
        for entry in batch.iter() {
            match &entry.change {
                Change::Upsert(payload) => {
                    match self.entries.iter_mut().find(|(id, _)| id == &entry.id) {
                        Some(existing) => existing.1 = payload.clone(),
                        None => self.entries.push((entry.id.clone(), payload.clone())),
                    }
                }
                Change::Tombstone => self.entries.retain(|(id, _)| id != &entry.id),
            }
        }
    }

    /// The state as one batch, messages newest first like a fresh listener.
    fn snapshot(&self) -> ChangeBatch {
        let mut entries: Vec<ChangeEntry> = self
            .entries
            .iter()
            .map(|(id, payload)| ChangeEntry::upsert(id.clone(), payload.clone()))
            .collect();
        entries.sort_by(|a, b| {
            let ts = |entry: &ChangeEntry| match entry.payload() {
                Some(Payload::Message(m)) => m.created_at,
                _ => None,
            };
            match (ts(a), ts(b)) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => y.cmp(&x),
            }
        });
        ChangeBatch::new(entries)
    }
}

struct Slot {
    generation: u64,
    live: bool,
    sinks: Vec<(u64, Sink)>,
    current: Materialized,
    guard: Option<ListenerGuard>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.detach();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct Inner {
    feed: Arc<dyn LiveQueryFeed>,
    documents: Arc<dyn DocumentStore>,
    config: ClientConfig,
    slots: Mutex<HashMap<SubscriptionKey, Slot>>,
    next_id: AtomicU64,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn open(&self, key: &SubscriptionKey) -> murmur_store::Result<Listener> {
        match key {
            SubscriptionKey::Feed => self.feed.listen_query(&self.config.feed_query()).await,
            SubscriptionKey::Profile(user) => {
                self.documents
                    .listen_document(&self.config.users_collection, user.as_str())
                    .await
            }
            SubscriptionKey::Presence(user) => {
                self.documents
                    .listen_document(&self.config.presence_collection, user.as_str())
                    .await
            }
        }
    }

    /// Forward a decoded batch to every handle of `key`. Returns `false`
    /// when the slot this pump belongs to no longer exists.
    fn deliver(&self, key: &SubscriptionKey, generation: u64, batch: ChangeBatch) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key).filter(|s| s.generation == generation) else {
            return false;
        };
        slot.current.apply(&batch);
        let batch = Arc::new(batch);
        for (_, sink) in &slot.sinks {
            let _ = sink.send(batch.clone());
        }
        true
    }

    fn remove_sink(&self, key: &SubscriptionKey, handle_id: u64) {
        let removed = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            slot.sinks.retain(|(id, _)| *id != handle_id);
            if slot.sinks.is_empty() {
                slots.remove(key)
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!(key = %key, "Last subscriber released, listener detached");
        }
    }

    fn upstream_ended(&self, key: &SubscriptionKey, generation: u64) {
        let removed = {
            let mut slots = self.slots();
            if slots.get(key).is_some_and(|s| s.generation == generation) {
                slots.remove(key)
            } else {
                None
            }
        };
        if removed.is_some() {
            warn!(key = %key, "Upstream listener ended");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut *self.slots());
        if !slots.is_empty() {
            debug!(count = slots.len(), "Closing subscriptions on drop");
        }
    }
}

async fn pump(
    inner: Weak<Inner>,
    key: SubscriptionKey,
    generation: u64,
    mut changes: mpsc::UnboundedReceiver<Vec<DocChange>>,
    defaults: ProfileDefaults,
) {
    let kind = key.payload_kind();
    while let Some(raw) = changes.recv().await {
        let batch = decode_batch(kind, raw, &defaults);
        debug!(key = %key, entries = batch.len(), rejected = batch.rejected, "Batch received");
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.deliver(&key, generation, batch) {
            return;
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.upstream_ended(&key, generation);
    }
}

/// Removes a half-open slot when `subscribe` is cancelled while the
/// upstream listener is being opened. Handles that joined the slot in the
/// meantime see end-of-stream.
struct OpenGuard<'a> {
    inner: &'a Inner,
    key: SubscriptionKey,
    generation: u64,
    armed: bool,
}

impl OpenGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = {
            let mut slots = self.inner.slots();
            if slots
                .get(&self.key)
                .is_some_and(|s| s.generation == self.generation && !s.live)
            {
                slots.remove(&self.key)
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!(key = %self.key, "Subscribe cancelled while opening, slot removed");
        }
    }
}

/// Owner of every live subscription of one client.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(backends: &Backends, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                feed: backends.feed.clone(),
                documents: backends.documents.clone(),
                config: config.clone(),
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to `key`, sharing the upstream listener when one is live.
    ///
    /// A handle joining a live key first receives the key's current state
    /// as a single batch. Fails when the upstream listener cannot be opened.
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<Subscription> {
        let handle_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let generation = {
            let mut slots = self.inner.slots();
            if let Some(slot) = slots.get_mut(&key) {
                if slot.live {
                    let _ = tx.send(Arc::new(slot.current.snapshot()));
                }
                slot.sinks.push((handle_id, tx));
                debug!(key = %key, subscribers = slot.sinks.len(), "Joined live subscription");
                return Ok(self.handle(key, handle_id, rx));
            }
            let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            slots.insert(
                key.clone(),
                Slot {
                    generation,
                    live: false,
                    sinks: vec![(handle_id, tx)],
                    current: Materialized::default(),
                    guard: None,
                    pump: None,
                },
            );
            generation
        };

        let opening = OpenGuard {
            inner: &self.inner,
            key: key.clone(),
            generation,
            armed: true,
        };
        let opened = self.inner.open(&key).await;
        opening.disarm();

        let mut slots = self.inner.slots();
        // The key may have been force-closed while the listener was opening.
        let owned = slots.get(&key).is_some_and(|s| s.generation == generation);
        match (opened, owned) {
            (Ok(listener), true) => {
                let (changes, guard) = listener.into_parts();
                let task = tokio::spawn(pump(
                    Arc::downgrade(&self.inner),
                    key.clone(),
                    generation,
                    changes,
                    self.inner.config.profile_defaults.clone(),
                ));
                if let Some(slot) = slots.get_mut(&key) {
                    slot.guard = Some(guard);
                    slot.live = true;
                    slot.pump = Some(task);
                }
                drop(slots);
                info!(key = %key, "Subscription opened");
                Ok(self.handle(key, handle_id, rx))
            }
            (Ok(listener), false) => {
                drop(slots);
                drop(listener);
                debug!(key = %key, "Subscription closed while opening");
                Err(ClientError::SubscriptionClosed(key.to_string()))
            }
            (Err(e), owned) => {
                let removed = if owned { slots.remove(&key) } else { None };
                drop(slots);
                drop(removed);
                warn!(key = %key, error = %e, "Failed to open subscription");
                Err(e.into())
            }
        }
    }

    fn handle(
        &self,
        key: SubscriptionKey,
        id: u64,
        rx: mpsc::UnboundedReceiver<Arc<ChangeBatch>>,
    ) -> Subscription {
        Subscription {
            key,
            id,
            rx,
            manager: Arc::downgrade(&self.inner),
            released: false,
        }
    }

    /// Force-close `key` for every handle. Returns whether it was open.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let removed = self.inner.slots().remove(key);
        let closed = removed.is_some();
        drop(removed);
        if closed {
            info!(key = %key, "Subscription closed");
        }
        closed
    }

    /// Close every subscription.
    pub fn shutdown(&self) {
        let slots = std::mem::take(&mut *self.inner.slots());
        if !slots.is_empty() {
            info!(count = slots.len(), "Closing all subscriptions");
        }
    }

    pub fn is_live(&self, key: &SubscriptionKey) -> bool {
        self.inner.slots().get(key).is_some_and(|s| s.live)
    }

    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.inner.slots().get(key).map_or(0, |s| s.sinks.len())
    }

    pub fn live_keys(&self) -> Vec<SubscriptionKey> {
        self.inner
            .slots()
            .iter()
            .filter(|(_, slot)| slot.live)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// One consumer's share of a keyed subscription.
///
/// Dropping the handle releases it. After release, batches that were
/// already queued can still be drained; nothing later is delivered.
pub struct Subscription {
    key: SubscriptionKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<ChangeBatch>>,
    manager: Weak<Inner>,
    released: bool,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Next batch, or `None` once the subscription is closed and drained.
    pub async fn next(&mut self) -> Option<Arc<ChangeBatch>> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Arc<ChangeBatch>> {
        self.rx.try_recv().ok()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Give up this handle's share. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.manager.upgrade() {
            inner.remove_sink(&self.key, self.id);
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for Subscription {
    type Item = Arc<ChangeBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}
