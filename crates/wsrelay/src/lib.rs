//! # wsrelay
//!
//! Topic-based publish/subscribe relay engine for WebSocket peers.
//!
//! This crate provides:
//! - **Protocol**: the `{type, topic, payload?}` envelope, fail-hard and fail-soft validation
//! - **Registry**: per-peer topic sets and a per-topic subscriber index
//! - **Broadcast**: fan-out publish and single-flight dedup broadcast
//! - **Hooks**: a named-event bus for out-of-band publishes
//! - **Store**: last-value-per-topic persistence behind the [`store::KeyValueStore`] trait
//! - **Relay**: the connection lifecycle (open / message / close / error)
//!
//! The transport (WebSocket upgrade, socket I/O) lives in `wsrelay_server`;
//! this crate only sees peers as [`registry::PeerHandle`]s.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod hooks;
pub mod merge;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod store;

pub use broadcast::{Broadcaster, Delivery, PublishOptions};
pub use config::{RelayConfig, TopicClass, TopicsConfig, WriteMode};
pub use error::{CodecError, RelayError, StoreError};
pub use hooks::{HookBus, HookHandle, HookMessage, TOPIC_PUBLISH};
pub use merge::{MergeStrategy, ObjectSpread, PeerList, Replace};
pub use protocol::{Envelope, EnvelopeSchema, Issue, ServerFrame, TopicShape, Validation};
pub use registry::{Frame, PeerHandle, PeerId, SubscriptionRegistry};
pub use relay::{
    AllowAll, Authorizer, CloseDetails, Connection, ConnectionState, ErrorObserver, Relay,
    RelayBuilder, TracingObserver,
};
pub use store::{KeyValueStore, MemoryStore, PrefixedStore};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
