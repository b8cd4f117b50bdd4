/// Application name
pub const APP_NAME: &str = "murmur";

/// Number of most recent messages the feed subscription retains
pub const FEED_WINDOW: usize = 50;

/// Default collection names in the remote document store
pub const MESSAGES_COLLECTION: &str = "messages";
pub const USERS_COLLECTION: &str = "users";
pub const PRESENCE_COLLECTION: &str = "presence";

/// Ordering key of the message feed (server-assigned)
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Last-seen field shared by profile and presence documents
pub const LAST_SEEN_FIELD: &str = "lastSeen";

/// Object storage prefix for chat media
pub const MEDIA_PREFIX: &str = "chat-media";

/// Maximum media size accepted for staging (50 MiB)
pub const MAX_MEDIA_SIZE: usize = 50 * 1024 * 1024;

/// Distance from the bottom (CSS px) under which the viewport counts as pinned
pub const PIN_THRESHOLD_PX: f64 = 1.0;

/// Placeholders shown until a profile arrives
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";
pub const DEFAULT_AVATAR_URL: &str = "https://api.dicebear.com/6.x/adventurer/svg?seed=Felix";

/// Presence heartbeat and staleness defaults (seconds)
pub const PRESENCE_HEARTBEAT_SECS: u64 = 60;
pub const PRESENCE_STALE_SECS: u64 = 300;
