use std::env;
use std::path::PathBuf;
use wsrelay::{RelayConfig, TopicsConfig, WriteMode};

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3000)
    pub port: u16,
    /// Engine configuration (route, reserved topics, queue size, write mode)
    pub relay: RelayConfig,
    /// Where topic records live (default: memory)
    pub store: StoreBackend,
    /// Key prefix for topic records (default: ws:)
    pub store_prefix: String,
    /// How publishes merge into the stored record (default: object)
    pub merge: MergeKind,
    /// Only accept topics starting with this prefix (default: any topic)
    pub topic_prefix: Option<String>,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

/// Topic record storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite(PathBuf),
}

/// Merge strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Shallow object merge, last key wins.
    Object,
    /// One entry per peer, tagged with `peerId`.
    PeerList,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let defaults = RelayConfig::default();

        let route = var("WS_ROUTE").unwrap_or(defaults.route);
        if !route.starts_with('/') {
            return Err(ConfigError::InvalidRoute(route));
        }

        let topics = TopicsConfig {
            internals: var("WS_TOPICS_INTERNALS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.topics.internals),
            defaults: var("WS_TOPICS_DEFAULTS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.topics.defaults),
        };

        let peer_buffer = match var("WS_PEER_BUFFER") {
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidPeerBuffer(v)),
            },
            None => defaults.peer_buffer,
        };

        let write_mode = if flag(var("WS_SERIALIZE_WRITES")) {
            WriteMode::Serialized
        } else {
            WriteMode::LastWriterWins
        };

        let announce_subscriptions = flag(var("WS_ANNOUNCE_SUBSCRIPTIONS"));

        let store = match var("WS_STORE").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => StoreBackend::Memory,
            Some(path) => StoreBackend::Sqlite(PathBuf::from(path)),
        };

        let store_prefix = var("WS_STORE_PREFIX").unwrap_or_else(|| "ws:".to_string());

        let merge = match var("WS_MERGE").as_deref().map(str::trim) {
            None | Some("") | Some("object") => MergeKind::Object,
            Some("peer-list") => MergeKind::PeerList,
            Some(other) => return Err(ConfigError::UnknownMerge(other.to_string())),
        };

        let topic_prefix = var("WS_TOPIC_PREFIX")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let cors_origins = split_list(
            &var("CORS_ORIGINS").unwrap_or_else(|| "http://localhost:3000".to_string()),
        );

        Ok(Config {
            host,
            port,
            relay: RelayConfig {
                route,
                topics,
                peer_buffer,
                write_mode,
                announce_subscriptions,
            },
            store,
            store_prefix,
            merge,
            topic_prefix,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn flag(raw: Option<String>) -> bool {
    raw.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidRoute(String),
    InvalidPeerBuffer(String),
    UnknownMerge(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidRoute(r) => write!(f, "WS_ROUTE must start with '/': {}", r),
            ConfigError::InvalidPeerBuffer(v) => {
                write!(f, "WS_PEER_BUFFER must be a positive integer: {}", v)
            }
            ConfigError::UnknownMerge(m) => {
                write!(f, "WS_MERGE must be 'object' or 'peer-list': {}", m)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
