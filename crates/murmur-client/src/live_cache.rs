//! Identity-keyed cache of live documents.
//!
//! Each identity gets one `watch` channel holding its current value. The
//! first request for an identity spawns a follower task that subscribes
//! through the [`SubscriptionManager`] and keeps the channel up to date;
//! later requests only clone a receiver. Until data arrives, and whenever
//! the document is removed, the channel holds a placeholder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_shared::protocol::{Change, ChangeBatch, Payload};
use murmur_shared::{PresenceRecord, ProfileDefaults, UserId, UserProfile};

use crate::subscriptions::{SubscriptionKey, SubscriptionManager};

/// A document type that can be cached per identity.
pub trait CachedRecord: Clone + PartialEq + Send + Sync + 'static {
    fn key(user: &UserId) -> SubscriptionKey;
    fn from_payload(payload: &Payload) -> Option<Self>;
    fn placeholder(user: &UserId, defaults: &ProfileDefaults) -> Self;
}

impl CachedRecord for UserProfile {
    fn key(user: &UserId) -> SubscriptionKey {
        SubscriptionKey::Profile(user.clone())
    }

    fn from_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Profile(profile) => Some(profile.clone()),
            _ => None,
        }
    }

    fn placeholder(user: &UserId, defaults: &ProfileDefaults) -> Self {
        UserProfile::placeholder(user.clone(), defaults)
    }
}

impl CachedRecord for PresenceRecord {
    fn key(user: &UserId) -> SubscriptionKey {
        SubscriptionKey::Presence(user.clone())
    }

    fn from_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Presence(record) => Some(record.clone()),
            _ => None,
        }
    }

    fn placeholder(user: &UserId, _defaults: &ProfileDefaults) -> Self {
        PresenceRecord::unknown(user.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Subscription requested, nothing received yet.
    Pending,
    /// At least one batch has been applied.
    Live,
    /// The subscription could not be opened or was closed upstream.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    pub value: T,
    pub status: EntryStatus,
}

/// Read handle on one cache entry. Always reflects the latest value.
#[derive(Debug, Clone)]
pub struct LiveHandle<T> {
    rx: watch::Receiver<CachedValue<T>>,
}

impl<T: Clone> LiveHandle<T> {
    pub fn get(&self) -> T {
        self.rx.borrow().value.clone()
    }

    pub fn status(&self) -> EntryStatus {
        self.rx.borrow().status
    }

    /// Wait for the next update. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().value.clone())
    }

    /// Wait until the entry leaves `Pending`.
    pub async fn settled(&mut self) -> EntryStatus {
        match self.rx.wait_for(|v| v.status != EntryStatus::Pending).await {
            Ok(current) => current.status,
            Err(_) => EntryStatus::Failed,
        }
    }
}

struct Entry<T> {
    /// Follower that currently owns the entry. Older followers are ignored.
    generation: u64,
    tx: watch::Sender<CachedValue<T>>,
    task: Option<JoinHandle<()>>,
}

struct CacheInner<T> {
    subscriptions: SubscriptionManager,
    defaults: ProfileDefaults,
    entries: Mutex<HashMap<UserId, Entry<T>>>,
    next_generation: AtomicU64,
}

impl<T: CachedRecord> CacheInner<T> {
    fn entries(&self) -> MutexGuard<'_, HashMap<UserId, Entry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, user: &UserId, generation: u64, batch: &ChangeBatch) {
        let entries = self.entries();
        let Some(entry) = entries.get(user).filter(|e| e.generation == generation) else {
            return;
        };
        entry.tx.send_modify(|current| {
            for change in batch.iter().filter(|c| c.id == user.as_str()) {
                match &change.change {
                    Change::Upsert(payload) => match T::from_payload(payload) {
                        Some(value) => current.value = value,
                        None => debug!(user = %user, "Ignoring payload of another kind"),
                    },
                    Change::Tombstone => current.value = T::placeholder(user, &self.defaults),
                }
            }
            current.status = EntryStatus::Live;
        });
    }

    fn mark_failed(&self, user: &UserId, generation: u64) {
        if let Some(entry) = self.entries().get(user).filter(|e| e.generation == generation) {
            entry.tx.send_modify(|current| current.status = EntryStatus::Failed);
        }
    }
}

impl<T> Drop for CacheInner<T> {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
    }
}

async fn follow<T: CachedRecord>(cache: Weak<CacheInner<T>>, user: UserId, generation: u64) {
    let Some(subscriptions) = cache.upgrade().map(|c| c.subscriptions.clone()) else {
        return;
    };

    let mut subscription = match subscriptions.subscribe(T::key(&user)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(user = %user, error = %e, "Live cache subscription failed");
            if let Some(cache) = cache.upgrade() {
                cache.mark_failed(&user, generation);
            }
            return;
        }
    };

    while let Some(batch) = subscription.next().await {
        let Some(cache) = cache.upgrade() else {
            return;
        };
        cache.apply(&user, generation, &batch);
    }

    debug!(user = %user, "Live cache subscription ended");
    if let Some(cache) = cache.upgrade() {
        cache.mark_failed(&user, generation);
    }
}

/// Cache of live `T` documents keyed by identity.
pub struct LiveCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for LiveCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: CachedRecord> LiveCache<T> {
    pub fn new(subscriptions: SubscriptionManager, defaults: ProfileDefaults) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                subscriptions,
                defaults,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Handle on `user`'s entry, subscribing on first use. A failed entry
    /// is returned as is.
    ///
    /// Must be called from within a tokio runtime.
    pub fn resolve(&self, user: &UserId) -> LiveHandle<T> {
        LiveHandle {
            rx: self.ensure(user, false),
        }
    }

    /// Make sure `user` is followed. Idempotent while the entry is pending
    /// or live; retries an entry whose subscription failed.
    pub fn ensure_subscribed(&self, user: &UserId) {
        self.ensure(user, true);
    }

    fn ensure(&self, user: &UserId, retry_failed: bool) -> watch::Receiver<CachedValue<T>> {
        let mut entries = self.inner.entries();
        if let Some(entry) = entries.get_mut(user) {
            if retry_failed && entry.tx.borrow().status == EntryStatus::Failed {
                debug!(user = %user, "Retrying failed live cache entry");
                let generation = self.next_generation();
                entry.generation = generation;
                entry
                    .tx
                    .send_modify(|current| current.status = EntryStatus::Pending);
                if let Some(old) = entry.task.replace(self.spawn_follower(user, generation)) {
                    old.abort();
                }
            }
            return entry.tx.subscribe();
        }

        let (tx, rx) = watch::channel(CachedValue {
            value: T::placeholder(user, &self.inner.defaults),
            status: EntryStatus::Pending,
        });
        let generation = self.next_generation();
        let task = self.spawn_follower(user, generation);
        entries.insert(
            user.clone(),
            Entry {
                generation,
                tx,
                task: Some(task),
            },
        );
        debug!(user = %user, "Live cache entry created");
        rx
    }

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_follower(&self, user: &UserId, generation: u64) -> JoinHandle<()> {
        tokio::spawn(follow(Arc::downgrade(&self.inner), user.clone(), generation))
    }

    /// Current value, or `None` when `user` was never requested.
    pub fn snapshot(&self, user: &UserId) -> Option<T> {
        self.inner
            .entries()
            .get(user)
            .map(|entry| entry.tx.borrow().value.clone())
    }

    /// Whether an entry exists for `user`, in any state.
    pub fn contains(&self, user: &UserId) -> bool {
        self.inner.entries().contains_key(user)
    }

    pub fn status(&self, user: &UserId) -> Option<EntryStatus> {
        self.inner
            .entries()
            .get(user)
            .map(|entry| entry.tx.borrow().status)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries().is_empty()
    }

    pub fn placeholder(&self, user: &UserId) -> T {
        T::placeholder(user, &self.inner.defaults)
    }
}
