//! Profile cache shared by everything that renders an author.

use murmur_shared::{ProfileDefaults, UserId, UserProfile};

use crate::live_cache::{EntryStatus, LiveCache, LiveHandle};
use crate::reconciler::AuthorLookup;
use crate::subscriptions::SubscriptionManager;

pub type ProfileHandle = LiveHandle<UserProfile>;

/// Live profiles keyed by identity.
///
/// Concurrent requests for one identity share a single upstream
/// subscription. Consumers hold a [`ProfileHandle`], so a placeholder is
/// replaced in place once the real profile arrives.
#[derive(Clone)]
pub struct UserDirectory {
    cache: LiveCache<UserProfile>,
}

impl UserDirectory {
    pub fn new(subscriptions: SubscriptionManager, defaults: ProfileDefaults) -> Self {
        Self {
            cache: LiveCache::new(subscriptions, defaults),
        }
    }

    pub fn resolve(&self, user: &UserId) -> ProfileHandle {
        self.cache.resolve(user)
    }

    /// Follow every user in `users`. A failed entry is retried.
    pub fn ensure_subscribed<'a>(&self, users: impl IntoIterator<Item = &'a UserId>) {
        for user in users {
            self.cache.ensure_subscribed(user);
        }
    }

    /// Current profile, or the placeholder when `user` is unknown.
    pub fn profile(&self, user: &UserId) -> UserProfile {
        self.cache
            .snapshot(user)
            .unwrap_or_else(|| self.cache.placeholder(user))
    }

    pub fn snapshot(&self, user: &UserId) -> Option<UserProfile> {
        self.cache.snapshot(user)
    }

    pub fn status(&self, user: &UserId) -> Option<EntryStatus> {
        self.cache.status(user)
    }

    /// Whether `user` has an entry in any status.
    pub fn is_known(&self, user: &UserId) -> bool {
        self.cache.contains(user)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl AuthorLookup for UserDirectory {
    fn is_known(&self, user: &UserId) -> bool {
        self.cache.contains(user)
    }
}
