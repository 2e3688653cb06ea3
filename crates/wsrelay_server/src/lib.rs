//! WebSocket transport for the `wsrelay` engine.
//!
//! Mounts the relay on an axum router: the socket upgrade at the configured
//! route, an HTTP endpoint that injects `topic-publish` hook events, and a
//! health check.

pub mod config;
pub mod handlers;

use axum::{Router, routing::get};
use std::sync::Arc;
use wsrelay::{
    EnvelopeSchema, KeyValueStore, MemoryStore, ObjectSpread, PeerList, PrefixedStore, Relay,
    SqliteStore, StoreError, TopicShape,
};

use crate::config::{Config, MergeKind, StoreBackend};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

/// Build the relay described by `config`.
pub fn build_relay(config: &Config) -> Result<Arc<Relay>, StoreError> {
    let backend: Arc<dyn KeyValueStore> = match &config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite(path) => Arc::new(SqliteStore::open(path)?),
    };
    let store = PrefixedStore::new(backend, config.store_prefix.clone());

    let builder = Relay::builder(config.relay.clone(), store);
    let builder = match config.merge {
        MergeKind::Object => builder.merge(ObjectSpread),
        MergeKind::PeerList => builder.merge(PeerList::default()),
    };
    let builder = match &config.topic_prefix {
        Some(prefix) => builder.schema(
            EnvelopeSchema::new().topic(TopicShape::new().trimmed().non_empty().starts_with(prefix.clone())),
        ),
        None => builder,
    };

    Ok(builder.build())
}

/// Routes without middleware. `main` adds CORS and tracing layers on top.
pub fn router(state: AppState) -> Router {
    let route = state.relay.config().route.clone();
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(&route, get(handlers::ws::ws_handler))
        .nest("/api", handlers::api_routes())
        .with_state(state)
}
