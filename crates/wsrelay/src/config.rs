//! Relay configuration.
//!
//! Set once at startup and shared immutably (behind an `Arc`) by every
//! connection for the lifetime of the process.

use serde::Deserialize;

/// Reserved topic carrying the connection id announcement.
pub const INTERNAL_TOPIC: &str = "_internal";

/// Reserved topic carrying `{users: <int>}` on every connect/disconnect.
pub const SESSION_TOPIC: &str = "session";

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upgrade path the transport mounts the socket handler on.
    pub route: String,
    /// Reserved topic classes.
    pub topics: TopicsConfig,
    /// Per-peer outbound queue capacity. Frames beyond it are dropped.
    pub peer_buffer: usize,
    /// How concurrent read-modify-writes on the same topic are handled.
    pub write_mode: WriteMode,
    /// Re-send the `_internal` frame after every accepted subscribe/unsubscribe.
    pub announce_subscriptions: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            route: "/_ws".to_string(),
            topics: TopicsConfig::default(),
            peer_buffer: 256,
            write_mode: WriteMode::default(),
            announce_subscriptions: false,
        }
    }
}

/// Ordered lists of reserved topics.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// System-only topics. Clients can never subscribe to or unsubscribe from them.
    pub internals: Vec<String>,
    /// Topics every peer is subscribed to on connect.
    pub defaults: Vec<String>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            internals: vec![INTERNAL_TOPIC.to_string()],
            defaults: vec![SESSION_TOPIC.to_string()],
        }
    }
}

/// Class of a topic name under a given configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    Internal,
    Default,
    Ordinary,
}

impl TopicsConfig {
    /// Classify a topic. A name listed as both internal and default is internal.
    pub fn classify(&self, topic: &str) -> TopicClass {
        if self.is_internal(topic) {
            TopicClass::Internal
        } else if self.is_default(topic) {
            TopicClass::Default
        } else {
            TopicClass::Ordinary
        }
    }

    pub fn is_internal(&self, topic: &str) -> bool {
        self.internals.iter().any(|t| t == topic)
    }

    pub fn is_default(&self, topic: &str) -> bool {
        self.defaults.iter().any(|t| t == topic)
    }

    /// Internal then default topics, in declared order, without duplicates.
    pub fn auto_subscribed(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = Vec::with_capacity(self.internals.len() + self.defaults.len());
        for topic in self.internals.iter().chain(self.defaults.iter()) {
            if !topics.contains(&topic.as_str()) {
                topics.push(topic);
            }
        }
        topics
    }
}

/// Handling of concurrent read-modify-write cycles on one topic record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Reads and writes from different peers interleave freely; the last
    /// write wins and earlier concurrent contributions can be lost.
    #[default]
    LastWriterWins,
    /// Each topic's read-modify-write runs under a per-topic async mutex.
    Serialized,
}
