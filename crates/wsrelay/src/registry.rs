//! Process-wide registry of connected peers and their topic subscriptions.
//!
//! Two views are kept consistent under the peer-table lock:
//! - peer → subscribed topics (in subscription order)
//! - topic → subscribed peers (in subscription order), sharded by topic
//!
//! Every attachment and subscription is stamped with a monotonically
//! increasing sequence number. Traversals walk these stamps with a cursor,
//! so they observe live state without holding a lock between items, and a
//! concurrent removal never shifts or skips the entries still ahead of the
//! cursor.

use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ==================== Peer Identity ====================

/// Opaque peer identifier, unique for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// A fresh random (UUID v4) id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ==================== Frames & Handles ====================

/// An encoded outbound text frame. Cloning shares the buffer, so a frame
/// serialized once can be handed to any number of peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub text: Arc<str>,
    /// Transport hint: the frame may be sent with per-message compression.
    pub compress: bool,
}

impl Frame {
    pub fn new(text: impl Into<Arc<str>>, compress: bool) -> Self {
        Self {
            text: text.into(),
            compress,
        }
    }

    pub fn compressed(text: impl Into<Arc<str>>) -> Self {
        Self::new(text, true)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// The engine's reference to a live peer: its id plus the sending half of
/// the transport's outbound queue. The transport owns the receiving half.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    tx: mpsc::Sender<Frame>,
}

impl PeerHandle {
    /// Create a handle and the receiver the transport drains into the socket.
    pub fn channel(id: PeerId, buffer: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Queue a frame without waiting. Returns `false` when the frame was
    /// dropped because the queue is full or the transport went away.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full for peer {}, frame dropped", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Peer {} is gone, frame dropped", self.id);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ==================== Registry ====================

struct PeerEntry {
    seq: u64,
    handle: PeerHandle,
    /// topic → subscription stamp
    topics: IndexMap<String, u64>,
}

#[derive(Default)]
struct PeerTable {
    /// attachment stamp → peer, in connect order
    order: BTreeMap<u64, PeerId>,
    entries: HashMap<PeerId, PeerEntry>,
}

/// Peers and per-topic subscriber sets.
pub struct SubscriptionRegistry {
    peers: RwLock<PeerTable>,
    /// topic → (subscription stamp → peer)
    index: DashMap<String, BTreeMap<u64, PeerId>>,
    next_seq: AtomicU64,
    generation: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(PeerTable::default()),
            index: DashMap::new(),
            next_seq: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PeerTable> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerTable> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamp(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn unindex(&self, topic: &str, seq: u64) {
        if let Some(mut subscribers) = self.index.get_mut(topic) {
            subscribers.remove(&seq);
        }
        self.index.remove_if(topic, |_, subscribers| subscribers.is_empty());
    }

    /// Add a peer with no subscriptions. Returns `false` if the id is taken.
    pub fn attach(&self, handle: PeerHandle) -> bool {
        let mut table = self.write();
        if table.entries.contains_key(handle.id()) {
            return false;
        }
        let seq = self.stamp();
        table.order.insert(seq, handle.id().clone());
        table.entries.insert(
            handle.id().clone(),
            PeerEntry {
                seq,
                handle,
                topics: IndexMap::new(),
            },
        );
        self.bump();
        true
    }

    /// Remove a peer and every subscription it holds.
    ///
    /// Returns the topics it was subscribed to, or `None` if it was unknown.
    pub fn detach(&self, peer: &PeerId) -> Option<Vec<String>> {
        let mut table = self.write();
        let entry = table.entries.remove(peer)?;
        table.order.remove(&entry.seq);
        for (topic, seq) in &entry.topics {
            self.unindex(topic, *seq);
        }
        self.bump();
        Some(entry.topics.into_keys().collect())
    }

    /// Idempotent. Returns `true` if the subscription was added by this call.
    pub fn subscribe(&self, peer: &PeerId, topic: &str) -> bool {
        let mut table = self.write();
        let Some(entry) = table.entries.get_mut(peer) else {
            return false;
        };
        if entry.topics.contains_key(topic) {
            return false;
        }
        let seq = self.stamp();
        entry.topics.insert(topic.to_string(), seq);
        self.index
            .entry(topic.to_string())
            .or_default()
            .insert(seq, peer.clone());
        self.bump();
        true
    }

    /// Idempotent. Returns `true` if a subscription was removed by this call.
    pub fn unsubscribe(&self, peer: &PeerId, topic: &str) -> bool {
        let mut table = self.write();
        let Some(entry) = table.entries.get_mut(peer) else {
            return false;
        };
        let Some(seq) = entry.topics.shift_remove(topic) else {
            return false;
        };
        self.unindex(topic, seq);
        self.bump();
        true
    }

    pub fn is_subscribed(&self, peer: &PeerId, topic: &str) -> bool {
        self.read()
            .entries
            .get(peer)
            .is_some_and(|entry| entry.topics.contains_key(topic))
    }

    /// Topics a peer is subscribed to, in subscription order.
    pub fn topics_of(&self, peer: &PeerId) -> Vec<String> {
        self.read()
            .entries
            .get(peer)
            .map(|entry| entry.topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn handle(&self, peer: &PeerId) -> Option<PeerHandle> {
        self.read().entries.get(peer).map(|e| e.handle.clone())
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.read().entries.contains_key(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.read().entries.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.index.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Counter bumped by every mutation. Two traversals that see the same
    /// generation see the same order.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Live traversal of a topic's subscribers in subscription order.
    pub fn subscribers_of(&self, topic: &str) -> Subscribers<'_> {
        Subscribers {
            registry: self,
            topic: topic.to_string(),
            cursor: None,
        }
    }

    /// Live traversal of all connected peers in connect order.
    pub fn all_peers(&self) -> AllPeers<'_> {
        AllPeers {
            registry: self,
            cursor: None,
        }
    }
}

fn after(cursor: Option<u64>) -> (Bound<u64>, Bound<u64>) {
    match cursor {
        Some(seq) => (Bound::Excluded(seq), Bound::Unbounded),
        None => (Bound::Unbounded, Bound::Unbounded),
    }
}

/// Iterator returned by [`SubscriptionRegistry::subscribers_of`].
///
/// Each step takes the topic's shard lock just long enough to find the next
/// stamp past the cursor. Peers that subscribe mid-traversal are yielded;
/// peers that leave before being reached are not.
pub struct Subscribers<'a> {
    registry: &'a SubscriptionRegistry,
    topic: String,
    cursor: Option<u64>,
}

impl Subscribers<'_> {
    /// Restart the traversal from the first subscriber.
    pub fn rewind(&mut self) {
        self.cursor = None;
    }
}

impl Iterator for Subscribers<'_> {
    type Item = PeerHandle;

    fn next(&mut self) -> Option<PeerHandle> {
        loop {
            let (seq, peer) = {
                let subscribers = self.registry.index.get(&self.topic)?;
                let (seq, peer) = subscribers.range(after(self.cursor)).next()?;
                (*seq, peer.clone())
            };
            self.cursor = Some(seq);
            if let Some(handle) = self.registry.handle(&peer) {
                return Some(handle);
            }
        }
    }
}

/// Iterator returned by [`SubscriptionRegistry::all_peers`].
pub struct AllPeers<'a> {
    registry: &'a SubscriptionRegistry,
    cursor: Option<u64>,
}

impl AllPeers<'_> {
    pub fn rewind(&mut self) {
        self.cursor = None;
    }
}

impl Iterator for AllPeers<'_> {
    type Item = PeerHandle;

    fn next(&mut self) -> Option<PeerHandle> {
        let table = self.registry.read();
        let (seq, peer) = table.order.range(after(self.cursor)).next()?;
        self.cursor = Some(*seq);
        table.entries.get(peer).map(|e| e.handle.clone())
    }
}
