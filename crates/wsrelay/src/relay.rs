//! Connection lifecycle: open, message, close and error handling.
//!
//! A [`Relay`] owns everything shared between connections (registry, store,
//! hook bus, configuration). The transport creates one [`Connection`] per
//! socket and drives it:
//!
//! ```text
//! Connecting --open()--> Open --close()--> Closed
//!                         |  ^
//!                         +--+ handle_message() / handle_error()
//! ```
//!
//! The `&mut self` receivers give per-peer ordering: one connection's
//! messages are processed strictly in arrival order, while different
//! connections run concurrently against the shared state.

use dashmap::DashMap;
use serde_json::{Value, json};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, PublishOptions};
use crate::config::{INTERNAL_TOPIC, RelayConfig, SESSION_TOPIC, TopicClass, WriteMode};
use crate::error::{RelayError, StoreError};
use crate::hooks::{HookBus, HookHandle, HookMessage, TOPIC_PUBLISH};
use crate::merge::{MergeStrategy, ObjectSpread};
use crate::protocol::{Envelope, EnvelopeSchema, ServerFrame, Validation, safe_validate_message};
use crate::registry::{Frame, PeerHandle, PeerId, SubscriptionRegistry};
use crate::store::KeyValueStore;

// ==================== Policy Points ====================

/// Decides whether a peer may subscribe to a topic. A rejection is silent.
pub trait Authorizer: Send + Sync {
    fn can_subscribe(&self, peer: &PeerId, topic: &str) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&PeerId, &str) -> bool + Send + Sync,
{
    fn can_subscribe(&self, peer: &PeerId, topic: &str) -> bool {
        self(peer, topic)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_subscribe(&self, _peer: &PeerId, _topic: &str) -> bool {
        true
    }
}

/// Receives transport errors reported through [`Connection::handle_error`].
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, peer: &PeerId, error: &(dyn std::error::Error + 'static));
}

/// Logs every reported error.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ErrorObserver for TracingObserver {
    fn on_error(&self, peer: &PeerId, err: &(dyn std::error::Error + 'static)) {
        error!("Peer {} connection error: {}", peer, err);
    }
}

// ==================== Relay ====================

pub struct RelayBuilder {
    config: RelayConfig,
    store: Arc<dyn KeyValueStore>,
    merge: Arc<dyn MergeStrategy>,
    authorizer: Arc<dyn Authorizer>,
    schema: EnvelopeSchema,
    observer: Arc<dyn ErrorObserver>,
    hooks: Option<Arc<HookBus>>,
}

impl RelayBuilder {
    pub fn new(config: RelayConfig, store: impl KeyValueStore + 'static) -> Self {
        Self {
            config,
            store: Arc::new(store),
            merge: Arc::new(ObjectSpread),
            authorizer: Arc::new(AllowAll),
            schema: EnvelopeSchema::default(),
            observer: Arc::new(TracingObserver),
            hooks: None,
        }
    }

    /// How publishes fold into the stored record. Defaults to [`ObjectSpread`].
    pub fn merge(mut self, merge: impl MergeStrategy + 'static) -> Self {
        self.merge = Arc::new(merge);
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Schema inbound messages are validated against.
    pub fn schema(mut self, schema: EnvelopeSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn observer(mut self, observer: impl ErrorObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Share an existing hook bus instead of creating a private one.
    pub fn hooks(mut self, hooks: Arc<HookBus>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Arc<Relay> {
        let registry = Arc::new(SubscriptionRegistry::new());
        Arc::new(Relay {
            config: self.config,
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            store: self.store,
            merge: self.merge,
            authorizer: self.authorizer,
            schema: self.schema,
            observer: self.observer,
            hooks: self.hooks.unwrap_or_default(),
            listeners: DashMap::new(),
            topic_locks: DashMap::new(),
        })
    }
}

/// The relay engine shared by every connection.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Broadcaster,
    store: Arc<dyn KeyValueStore>,
    merge: Arc<dyn MergeStrategy>,
    authorizer: Arc<dyn Authorizer>,
    schema: EnvelopeSchema,
    observer: Arc<dyn ErrorObserver>,
    hooks: Arc<HookBus>,
    /// peer → its `topic-publish` listener
    listeners: DashMap<PeerId, HookHandle>,
    /// Per-topic write locks, only used in [`WriteMode::Serialized`].
    topic_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("peers", &self.registry.peer_count())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Relay {
    pub fn builder(config: RelayConfig, store: impl KeyValueStore + 'static) -> RelayBuilder {
        RelayBuilder::new(config, store)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Number of live `topic-publish` listeners owned by connections.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Wrap a transport peer in a new connection, in the `Connecting` state.
    pub fn connect(self: &Arc<Self>, peer: PeerHandle) -> Connection {
        Connection {
            relay: self.clone(),
            peer,
            state: ConnectionState::Connecting,
            error_observed: false,
        }
    }

    /// Create a connection with a fresh id and a channel sized by
    /// `peer_buffer`. The receiver is what the transport writes to the socket.
    pub fn accept(self: &Arc<Self>) -> (Connection, mpsc::Receiver<Frame>) {
        let (peer, rx) = PeerHandle::channel(PeerId::random(), self.config.peer_buffer);
        (self.connect(peer), rx)
    }

    /// Server-initiated single-flight broadcast. Returns the peer elected to
    /// send, or `None` when the topic has no subscribers.
    pub fn broadcast(&self, topic: &str, payload: &Value) -> Option<PeerId> {
        let frame = encode(topic, payload);
        let (elected, delivery) = self.broadcaster.broadcast_once(topic, &frame)?;
        debug!(
            "Broadcast on {} via {}: {} sent, {} dropped",
            topic,
            elected.id(),
            delivery.sent,
            delivery.dropped
        );
        Some(elected.id().clone())
    }

    /// Inject messages through the `topic-publish` hook. Returns how many
    /// listeners ran.
    pub fn trigger_publish(&self, messages: &[HookMessage]) -> usize {
        self.hooks.trigger(TOPIC_PUBLISH, messages)
    }

    fn listen(self: &Arc<Self>, peer: &PeerHandle) {
        let relay: Weak<Relay> = Arc::downgrade(self);
        let owner = peer.clone();
        let handle = self.hooks.on(TOPIC_PUBLISH, move |messages| {
            let Some(relay) = relay.upgrade() else {
                return;
            };
            for message in messages {
                let Some((topic, payload)) = message.parts() else {
                    continue;
                };
                relay
                    .broadcaster
                    .broadcast_from(&owner, topic, &encode(topic, payload));
            }
        });
        if let Some(previous) = self.listeners.insert(peer.id().clone(), handle) {
            self.hooks.off(&previous);
        }
    }

    fn unlisten(&self, peer: &PeerId) -> bool {
        match self.listeners.remove(peer) {
            Some((_, handle)) => self.hooks.off(&handle),
            None => false,
        }
    }

    async fn write_guard(&self, topic: &str) -> Option<TopicWriteGuard<'_>> {
        match self.config.write_mode {
            WriteMode::LastWriterWins => None,
            WriteMode::Serialized => {
                let lock = self.topic_locks.entry(topic.to_string()).or_default().clone();
                Some(TopicWriteGuard {
                    locks: &self.topic_locks,
                    topic: topic.to_string(),
                    guard: Some(lock.lock_owned().await),
                })
            }
        }
    }

    /// Read-modify-write of a topic record for a publish, then fan-out of
    /// the stored result. In serialized mode the fan-out happens under the
    /// topic lock, so subscribers see records in write order.
    async fn publish_merged(&self, sender: &PeerHandle, topic: &str, payload: &Value) -> Result<(), StoreError> {
        let _guard = self.write_guard(topic).await;
        let current = match self.store.get_item(topic).await? {
            Some(current) => current,
            None => self.merge.empty(),
        };
        let merged = self.merge.merge(current, payload, sender.id());
        self.store.set_item(topic, merged.clone()).await?;
        self.broadcaster.publish(
            Some(sender),
            topic,
            &encode(topic, &merged),
            PublishOptions::to_sender(),
        );
        Ok(())
    }

    /// Strip `peer`'s contribution from a topic record and tell the remaining
    /// subscribers. No-op when the record holds nothing from `peer`.
    async fn retract(&self, peer: &PeerHandle, topic: &str) -> Result<(), StoreError> {
        let _guard = self.write_guard(topic).await;
        let Some(current) = self.store.get_item(topic).await? else {
            return Ok(());
        };
        let Some(updated) = self.merge.without_peer(&current, peer.id()) else {
            return Ok(());
        };
        self.store.set_item(topic, updated.clone()).await?;
        self.broadcaster
            .publish(Some(peer), topic, &encode(topic, &updated), PublishOptions::default());
        Ok(())
    }

    async fn replay(&self, peer: &PeerHandle, topic: &str) -> Result<(), StoreError> {
        if let Some(payload) = self.store.get_item(topic).await? {
            peer.send(encode(topic, &payload));
        }
        Ok(())
    }

    fn session_frame(&self) -> Frame {
        encode(SESSION_TOPIC, &json!({ "users": self.registry.peer_count() }))
    }

    fn internal_frame(&self, peer: &PeerId) -> Frame {
        let topics = self.registry.topics_of(peer);
        let message = if topics.is_empty() {
            "Not subscribed to any topic".to_string()
        } else {
            format!("Subscribed to {} topics", topics.len())
        };
        encode(
            INTERNAL_TOPIC,
            &json!({
                "connectionId": peer.as_str(),
                "topics": topics,
                "message": message,
            }),
        )
    }
}

/// Holds a topic's write lock. The lock entry is dropped from the map once
/// nobody holds or waits on it, so the map only ever holds topics in use.
struct TopicWriteGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    topic: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TopicWriteGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters hold a clone of the Arc, so a count of one means only the
        // map still references the lock.
        self.locks
            .remove_if(&self.topic, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn encode(topic: &str, payload: &Value) -> Frame {
    Frame::compressed(ServerFrame::new(topic, payload.clone()).encode())
}

// ==================== Connection ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Close code and reason reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseDetails {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

/// One peer's lifecycle. Created by [`Relay::connect`] or [`Relay::accept`].
///
/// Dropping a connection that is still open detaches it from the registry
/// and the hook bus, but skips the store cleanup and the session update that
/// [`Connection::close`] performs.
pub struct Connection {
    relay: Arc<Relay>,
    peer: PeerHandle,
    state: ConnectionState,
    error_observed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", self.peer.id())
            .field("state", &self.state)
            .field("error_observed", &self.error_observed)
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> &PeerId {
        self.peer.id()
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Whether [`Connection::handle_error`] was ever called.
    pub fn error_observed(&self) -> bool {
        self.error_observed
    }

    pub fn topics(&self) -> Vec<String> {
        self.relay.registry.topics_of(self.peer.id())
    }

    fn closed(&self) -> RelayError {
        RelayError::Closed(self.peer.id().to_string())
    }

    /// Connecting → Open.
    ///
    /// Subscribes the reserved topics, registers the hook listener, replays
    /// stored records, announces the connection id and publishes the new
    /// peer count on `session` (the new peer included).
    pub async fn open(&mut self) -> Result<(), RelayError> {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Open => return Ok(()),
            ConnectionState::Closed => return Err(self.closed()),
        }

        let relay = self.relay.clone();
        let id = self.peer.id().clone();
        if !relay.registry.attach(self.peer.clone()) {
            return Err(RelayError::DuplicatePeer(id.to_string()));
        }
        self.state = ConnectionState::Open;
        info!("New connection: {}", id);

        // Registered before the topics so an event can never elect this peer
        // while it has no listener.
        relay.listen(&self.peer);
        for topic in relay.config.topics.auto_subscribed() {
            relay.registry.subscribe(&id, topic);
        }

        for topic in relay.registry.topics_of(&id) {
            relay.replay(&self.peer, &topic).await?;
        }

        self.peer.send(relay.internal_frame(&id));
        relay.broadcaster.publish(
            Some(&self.peer),
            SESSION_TOPIC,
            &relay.session_frame(),
            PublishOptions::to_sender(),
        );
        Ok(())
    }

    /// Open → Open. Invalid and rejected messages are dropped without a
    /// reply; only store failures come back as errors.
    pub async fn handle_message(&mut self, raw: &str) -> Result<(), RelayError> {
        match self.state {
            ConnectionState::Open => {}
            ConnectionState::Connecting => {
                debug!("Ignoring message for {} before open", self.peer.id());
                return Ok(());
            }
            ConnectionState::Closed => return Err(self.closed()),
        }

        let envelope = match safe_validate_message(&self.relay.schema, raw) {
            Validation::Valid(envelope) => envelope,
            Validation::Invalid(issues) => {
                debug!(
                    "Dropping invalid message from {}: {} issue(s), first: {}",
                    self.peer.id(),
                    issues.len(),
                    issues.first().map(|i| i.to_string()).unwrap_or_default()
                );
                return Ok(());
            }
        };

        match envelope {
            Envelope::Subscribe { topic } => self.subscribe(&topic).await,
            Envelope::Unsubscribe { topic } => self.unsubscribe(&topic).await,
            Envelope::Publish { topic, payload } => self.publish(&topic, &payload).await,
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), RelayError> {
        let relay = self.relay.clone();
        let id = self.peer.id();
        if relay.config.topics.classify(topic) != TopicClass::Ordinary {
            debug!("Ignoring subscribe to reserved topic {} from {}", topic, id);
            return Ok(());
        }
        if !relay.authorizer.can_subscribe(id, topic) {
            debug!("Peer {} not authorized for {}", id, topic);
            return Ok(());
        }

        relay.registry.subscribe(id, topic);
        relay.replay(&self.peer, topic).await?;
        if relay.config.announce_subscriptions {
            self.peer.send(relay.internal_frame(id));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), RelayError> {
        let relay = self.relay.clone();
        let id = self.peer.id();
        if relay.config.topics.classify(topic) != TopicClass::Ordinary {
            debug!("Ignoring unsubscribe from reserved topic {} by {}", topic, id);
            return Ok(());
        }

        relay.registry.unsubscribe(id, topic);
        relay.retract(&self.peer, topic).await?;
        if relay.config.announce_subscriptions {
            self.peer.send(relay.internal_frame(id));
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &Value) -> Result<(), RelayError> {
        let relay = self.relay.clone();
        if relay.config.topics.is_internal(topic) {
            debug!("Ignoring publish to internal topic {} from {}", topic, self.peer.id());
            return Ok(());
        }

        relay.publish_merged(&self.peer, topic, payload).await?;
        Ok(())
    }

    /// Report a transport error. Never changes the state.
    pub fn handle_error(&mut self, err: &(dyn std::error::Error + 'static)) {
        self.error_observed = true;
        self.relay.observer.on_error(self.peer.id(), err);
    }

    /// Open → Closed.
    ///
    /// Detaches the peer, publishes the new peer count on `session`, removes
    /// the peer's contribution from every ordinary topic it held and releases
    /// its hook listener. The listener is released even when a store call
    /// fails; the first store error is returned after all topics were tried.
    pub async fn close(&mut self, details: CloseDetails) -> Result<(), RelayError> {
        match self.state {
            ConnectionState::Open => {}
            ConnectionState::Connecting => {
                self.state = ConnectionState::Closed;
                return Ok(());
            }
            ConnectionState::Closed => return Ok(()),
        }

        let relay = self.relay.clone();
        let id = self.peer.id().clone();
        info!(
            "Connection closed: {} ({}, {})",
            id,
            details.code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            details.reason.as_deref().unwrap_or("")
        );

        let topics = relay.registry.detach(&id).unwrap_or_default();
        self.state = ConnectionState::Closed;

        relay
            .broadcaster
            .publish(None, SESSION_TOPIC, &relay.session_frame(), PublishOptions::default());

        let mut first_error: Option<StoreError> = None;
        for topic in topics
            .iter()
            .filter(|t| relay.config.topics.classify(t) == TopicClass::Ordinary)
        {
            if let Err(e) = relay.retract(&self.peer, topic).await {
                error!("Failed to clean up {} for {}: {}", topic, id, e);
                first_error.get_or_insert(e);
            }
        }

        relay.unlisten(&id);

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }
        warn!("Connection {} dropped without close", self.peer.id());
        self.relay.registry.detach(self.peer.id());
        self.relay.unlisten(self.peer.id());
    }
}
