//! Online/offline signal for the local identity, and cached presence for
//! everyone else.
//!
//! Several sessions of one user may be open at once. Ownership of the
//! presence record is last-writer: going online always claims it, going
//! offline is skipped while another session holds a fresh online claim,
//! and heartbeats re-claim it so a session that was wrongly marked
//! offline corrects itself within one interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_shared::constants::LAST_SEEN_FIELD;
use murmur_shared::protocol::{decode_presence, Fields};
use murmur_shared::{PresenceRecord, UserId};
use murmur_store::{DocumentStore, SetOptions};

use crate::config::ClientConfig;
use crate::live_cache::{LiveCache, LiveHandle};
use crate::session::{Backends, SessionContext};
use crate::subscriptions::SubscriptionManager;

pub type PresenceHandle = LiveHandle<PresenceRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Unknown,
    Online,
    Offline,
}

/// Application lifecycle signals that drive the local presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    SessionEstablished,
    /// The app lost foreground visibility.
    Hidden,
    /// The app regained foreground visibility.
    Visible,
    /// The window or process is going away.
    Teardown,
    SignOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// No write was needed, or another session owns the record.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PresenceState,
    pub to: PresenceState,
    pub write: WriteOutcome,
}

/// How a reader should interpret someone's presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePresence {
    Unknown,
    Online,
    Offline { last_seen: Option<DateTime<Utc>> },
    /// Claims to be online but has not been refreshed within the bound.
    Suspect { last_seen: Option<DateTime<Utc>> },
}

/// Classify `record` as of `now` using `stale_after` as the freshness bound.
pub fn classify(record: &PresenceRecord, now: DateTime<Utc>, stale_after: Duration) -> RemotePresence {
    match (record.online, record.last_seen) {
        (false, None) => RemotePresence::Unknown,
        (false, last_seen) => RemotePresence::Offline { last_seen },
        (true, Some(ts)) if is_fresh(ts, now, stale_after) => RemotePresence::Online,
        (true, last_seen) => RemotePresence::Suspect { last_seen },
    }
}

fn is_fresh(last_seen: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match chrono::Duration::from_std(stale_after) {
        Ok(bound) => now.signed_duration_since(last_seen) <= bound,
        Err(_) => true,
    }
}

#[derive(Debug)]
struct Local {
    state: PresenceState,
    /// Cleared by sign-out or teardown.
    active: bool,
}

struct TrackerInner {
    session: SessionContext,
    documents: Arc<dyn DocumentStore>,
    users_collection: String,
    presence_collection: String,
    stale_after: Duration,
    heartbeat_interval: Duration,
    local: Mutex<Local>,
    remote: LiveCache<PresenceRecord>,
}

/// Publishes the local identity's presence and reads everyone else's.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

impl PresenceTracker {
    pub fn new(
        session: SessionContext,
        backends: &Backends,
        subscriptions: SubscriptionManager,
        config: &ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                session,
                documents: backends.documents.clone(),
                users_collection: config.users_collection.clone(),
                presence_collection: config.presence_collection.clone(),
                stale_after: config.presence_stale_after,
                heartbeat_interval: config.heartbeat_interval,
                local: Mutex::new(Local {
                    state: PresenceState::Unknown,
                    active: false,
                }),
                remote: LiveCache::new(subscriptions, config.profile_defaults.clone()),
            }),
        }
    }

    pub async fn state(&self) -> PresenceState {
        self.inner.local.lock().await.state
    }

    /// Apply a lifecycle event. Writes are best-effort: the local state
    /// follows the event even when the write fails.
    pub async fn handle(&self, event: LifecycleEvent) -> Transition {
        let mut local = self.inner.local.lock().await;
        let from = local.state;

        let (to, write) = match event {
            LifecycleEvent::SessionEstablished => {
                local.active = true;
                if from == PresenceState::Online {
                    (from, WriteOutcome::Skipped)
                } else {
                    self.merge_profile().await;
                    (PresenceState::Online, self.write_online().await)
                }
            }
            LifecycleEvent::Visible => {
                if local.active && from == PresenceState::Offline {
                    (PresenceState::Online, self.write_online().await)
                } else {
                    (from, WriteOutcome::Skipped)
                }
            }
            LifecycleEvent::Hidden => {
                if from == PresenceState::Online {
                    (PresenceState::Offline, self.write_offline().await)
                } else {
                    (from, WriteOutcome::Skipped)
                }
            }
            LifecycleEvent::Teardown | LifecycleEvent::SignOut => {
                local.active = false;
                if from == PresenceState::Online {
                    (PresenceState::Offline, self.write_offline().await)
                } else {
                    (from, WriteOutcome::Skipped)
                }
            }
        };

        local.state = to;
        drop(local);

        if from != to {
            info!(user = %self.inner.session.user, event = ?event, from = ?from, to = ?to, write = ?write, "Presence transition");
        } else {
            debug!(user = %self.inner.session.user, event = ?event, state = ?to, "Presence unchanged");
        }
        Transition { from, to, write }
    }

    /// Re-stamp the record while online, reclaiming ownership.
    pub async fn heartbeat(&self) -> WriteOutcome {
        let local = self.inner.local.lock().await;
        if local.state != PresenceState::Online {
            return WriteOutcome::Skipped;
        }
        let outcome = self.write_online().await;
        drop(local);
        debug!(user = %self.inner.session.user, outcome = ?outcome, "Presence heartbeat");
        outcome
    }

    /// Run [`heartbeat`](Self::heartbeat) on the configured interval until
    /// the returned guard is dropped.
    pub fn spawn_heartbeat(&self) -> HeartbeatGuard {
        let tracker = self.clone();
        let period = self.inner.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let WriteOutcome::Failed(reason) = tracker.heartbeat().await {
                    warn!(reason = %reason, "Presence heartbeat failed");
                }
            }
        });
        HeartbeatGuard { task }
    }

    /// Live presence of another identity.
    pub fn presence_of(&self, user: &UserId) -> PresenceHandle {
        self.inner.remote.resolve(user)
    }

    /// Classification of `user`'s cached record as of `now`.
    pub fn remote_presence(&self, user: &UserId, now: DateTime<Utc>) -> RemotePresence {
        match self.inner.remote.snapshot(user) {
            Some(record) => self.classify(&record, now),
            None => RemotePresence::Unknown,
        }
    }

    pub fn classify(&self, record: &PresenceRecord, now: DateTime<Utc>) -> RemotePresence {
        classify(record, now, self.inner.stale_after)
    }

    fn own_record(&self, online: bool) -> PresenceRecord {
        PresenceRecord {
            user: self.inner.session.user.clone(),
            online,
            last_seen: None,
            session_id: Some(self.inner.session.session_id.to_string()),
        }
    }

    async fn write_presence(&self, online: bool) -> WriteOutcome {
        let user = self.inner.session.user.as_str();
        let result = self
            .inner
            .documents
            .set(
                &self.inner.presence_collection,
                user,
                self.own_record(online).to_fields(),
                SetOptions::merge().stamped(LAST_SEEN_FIELD),
            )
            .await;
        match result {
            Ok(()) => {
                self.mirror_to_profile(online).await;
                WriteOutcome::Written
            }
            Err(e) => {
                warn!(user, online, error = %e, "Presence write failed");
                WriteOutcome::Failed(e.to_string())
            }
        }
    }

    async fn write_online(&self) -> WriteOutcome {
        self.write_presence(true).await
    }

    async fn write_offline(&self) -> WriteOutcome {
        if let Some(owner) = self.foreign_owner().await {
            debug!(user = %self.inner.session.user, owner = %owner, "Another session owns presence, not going offline");
            return WriteOutcome::Skipped;
        }
        self.write_presence(false).await
    }

    /// Session id of another session holding a fresh online claim.
    async fn foreign_owner(&self) -> Option<String> {
        let user = self.inner.session.user.as_str();
        let doc = match self.inner.documents.get(&self.inner.presence_collection, user).await {
            Ok(doc) => doc?,
            Err(e) => {
                debug!(user, error = %e, "Presence read failed, writing anyway");
                return None;
            }
        };
        let record = decode_presence(&doc).ok()?;
        let ours = self.inner.session.session_id.to_string();
        let fresh = record
            .last_seen
            .is_some_and(|ts| is_fresh(ts, Utc::now(), self.inner.stale_after));
        match record.session_id {
            Some(owner) if record.online && fresh && owner != ours => Some(owner),
            _ => None,
        }
    }

    /// Profiles carry a copy of the online flag for older readers.
    async fn mirror_to_profile(&self, online: bool) {
        let mut fields = Fields::new();
        fields.insert("online".into(), json!(online));
        if let Err(e) = self
            .inner
            .documents
            .set(
                &self.inner.users_collection,
                self.inner.session.user.as_str(),
                fields,
                SetOptions::merge().stamped(LAST_SEEN_FIELD),
            )
            .await
        {
            debug!(user = %self.inner.session.user, error = %e, "Profile presence mirror failed");
        }
    }

    async fn merge_profile(&self) {
        let session = &self.inner.session;
        let mut fields = Fields::new();
        if let Some(email) = &session.email {
            fields.insert("email".into(), json!(email));
        }
        if let Some(name) = &session.display_name {
            fields.insert("displayName".into(), json!(name));
        }
        if fields.is_empty() {
            return;
        }
        if let Err(e) = self
            .inner
            .documents
            .set(
                &self.inner.users_collection,
                session.user.as_str(),
                fields,
                SetOptions::merge(),
            )
            .await
        {
            warn!(user = %session.user, error = %e, "Profile merge on sign-in failed");
        }
    }
}

/// Stops the heartbeat task when dropped.
#[derive(Debug)]
pub struct HeartbeatGuard {
    task: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
