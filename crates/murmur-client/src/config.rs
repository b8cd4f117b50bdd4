//! Client configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the core can start with zero
//! configuration for local development.

use std::time::Duration;

use murmur_shared::constants::{
    CREATED_AT_FIELD, DEFAULT_AVATAR_URL, DEFAULT_DISPLAY_NAME, FEED_WINDOW, MAX_MEDIA_SIZE,
    MEDIA_PREFIX, MESSAGES_COLLECTION, PIN_THRESHOLD_PX, PRESENCE_COLLECTION,
    PRESENCE_HEARTBEAT_SECS, PRESENCE_STALE_SECS, USERS_COLLECTION,
};
use murmur_shared::ProfileDefaults;
use murmur_store::FeedQuery;

/// Synchronization core configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Collection holding chat messages.
    /// Env: `MURMUR_MESSAGES_COLLECTION`
    /// Default: `messages`
    pub messages_collection: String,

    /// Collection holding user profiles.
    /// Env: `MURMUR_USERS_COLLECTION`
    /// Default: `users`
    pub users_collection: String,

    /// Collection holding presence records.
    /// Env: `MURMUR_PRESENCE_COLLECTION`
    /// Default: `presence`
    pub presence_collection: String,

    /// Number of most recent messages kept by the feed subscription.
    /// Env: `MURMUR_FEED_WINDOW`
    /// Default: `50`
    pub feed_window: usize,

    /// Object storage prefix for uploaded media.
    /// Env: `MURMUR_MEDIA_PREFIX`
    /// Default: `chat-media`
    pub media_prefix: String,

    /// Largest media item accepted for staging, in bytes.
    /// Env: `MURMUR_MAX_MEDIA_BYTES`
    /// Default: 50 MiB
    pub max_media_bytes: usize,

    /// Distance from the bottom (px) at or under which the view is pinned.
    /// Env: `MURMUR_PIN_THRESHOLD_PX`
    /// Default: `1.0`
    pub pin_threshold_px: f64,

    /// Age after which an "online" presence record is treated as suspect.
    /// Env: `MURMUR_PRESENCE_STALE_SECS`
    /// Default: 300 s
    pub presence_stale_after: Duration,

    /// Interval between presence heartbeats while online.
    /// Env: `MURMUR_HEARTBEAT_SECS`
    /// Default: 60 s
    pub heartbeat_interval: Duration,

    /// Placeholders shown until a profile arrives.
    /// Env: `MURMUR_DEFAULT_DISPLAY_NAME`, `MURMUR_DEFAULT_AVATAR_URL`
    pub profile_defaults: ProfileDefaults,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            messages_collection: MESSAGES_COLLECTION.to_string(),
            users_collection: USERS_COLLECTION.to_string(),
            presence_collection: PRESENCE_COLLECTION.to_string(),
            feed_window: FEED_WINDOW,
            media_prefix: MEDIA_PREFIX.to_string(),
            max_media_bytes: MAX_MEDIA_SIZE,
            pin_threshold_px: PIN_THRESHOLD_PX,
            presence_stale_after: Duration::from_secs(PRESENCE_STALE_SECS),
            heartbeat_interval: Duration::from_secs(PRESENCE_HEARTBEAT_SECS),
            profile_defaults: ProfileDefaults {
                display_name: DEFAULT_DISPLAY_NAME.to_string(),
                avatar_url: DEFAULT_AVATAR_URL.to_string(),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = non_empty(lookup("MURMUR_MESSAGES_COLLECTION")) {
            config.messages_collection = name;
        }

        if let Some(name) = non_empty(lookup("MURMUR_USERS_COLLECTION")) {
            config.users_collection = name;
        }

        if let Some(name) = non_empty(lookup("MURMUR_PRESENCE_COLLECTION")) {
            config.presence_collection = name;
        }

        if let Some(val) = lookup("MURMUR_FEED_WINDOW") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.feed_window = n,
                _ => tracing::warn!(value = %val, "Invalid MURMUR_FEED_WINDOW, using default"),
            }
        }

        if let Some(prefix) = non_empty(lookup("MURMUR_MEDIA_PREFIX")) {
            config.media_prefix = prefix.trim_matches('/').to_string();
        }

        if let Some(val) = lookup("MURMUR_MAX_MEDIA_BYTES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_media_bytes = n,
                _ => tracing::warn!(value = %val, "Invalid MURMUR_MAX_MEDIA_BYTES, using default"),
            }
        }

        if let Some(val) = lookup("MURMUR_PIN_THRESHOLD_PX") {
            match val.parse::<f64>() {
                Ok(px) if px.is_finite() && px >= 0.0 => config.pin_threshold_px = px,
                _ => tracing::warn!(value = %val, "Invalid MURMUR_PIN_THRESHOLD_PX, using default"),
            }
        }

        if let Some(val) = lookup("MURMUR_PRESENCE_STALE_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.presence_stale_after = Duration::from_secs(secs),
                _ => {
                    tracing::warn!(value = %val, "Invalid MURMUR_PRESENCE_STALE_SECS, using default")
                }
            }
        }

        if let Some(val) = lookup("MURMUR_HEARTBEAT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid MURMUR_HEARTBEAT_SECS, using default"),
            }
        }

        if let Some(name) = non_empty(lookup("MURMUR_DEFAULT_DISPLAY_NAME")) {
            config.profile_defaults.display_name = name;
        }

        if let Some(url) = non_empty(lookup("MURMUR_DEFAULT_AVATAR_URL")) {
            config.profile_defaults.avatar_url = url;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// The newest-first window the feed subscription listens to.
    pub fn feed_query(&self) -> FeedQuery {
        FeedQuery::newest(&self.messages_collection, CREATED_AT_FIELD, self.feed_window)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.feed_window, 50);
        assert_eq!(config.messages_collection, "messages");
        assert_eq!(config.pin_threshold_px, 1.0);
        assert_eq!(config.profile_defaults.display_name, "Anonymous");
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("MURMUR_FEED_WINDOW", "20"),
            ("MURMUR_MEDIA_PREFIX", "/uploads/"),
            ("MURMUR_PRESENCE_STALE_SECS", "90"),
            ("MURMUR_DEFAULT_DISPLAY_NAME", "Guest"),
        ]));
        assert_eq!(config.feed_window, 20);
        assert_eq!(config.media_prefix, "uploads");
        assert_eq!(config.presence_stale_after, Duration::from_secs(90));
        assert_eq!(config.profile_defaults.display_name, "Guest");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("MURMUR_FEED_WINDOW", "0"),
            ("MURMUR_PIN_THRESHOLD_PX", "-3"),
            ("MURMUR_HEARTBEAT_SECS", "soon"),
            ("MURMUR_USERS_COLLECTION", "   "),
        ]));
        assert_eq!(config, ClientConfig::default());
    }
}
