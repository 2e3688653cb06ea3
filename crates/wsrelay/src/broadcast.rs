//! Fan-out and single-flight delivery of frames to topic subscribers.
//!
//! Frames are encoded once by the caller and shared across recipients.
//! Delivery is fire-and-forget: a peer whose queue is full or whose
//! transport is gone simply misses the frame.

use std::sync::Arc;
use tracing::debug;

use crate::registry::{Frame, PeerHandle, SubscriptionRegistry};

/// Options for [`Broadcaster::publish`].
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    /// Also deliver to the originating peer.
    pub to_sender: bool,
    pub compress: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            to_sender: false,
            compress: true,
        }
    }
}

impl PublishOptions {
    pub fn to_sender() -> Self {
        Self {
            to_sender: true,
            ..Self::default()
        }
    }
}

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub dropped: usize,
}

impl Delivery {
    fn record(&mut self, delivered: bool) {
        if delivered {
            self.sent += 1;
        } else {
            self.dropped += 1;
        }
    }

    fn absorb(&mut self, other: Delivery) {
        self.sent += other.sent;
        self.dropped += other.dropped;
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Fan-out publish.
    ///
    /// Sends to `sender` first when `to_sender` is set, then to every other
    /// current subscriber of `topic`. The sender never receives two copies,
    /// whether or not it is itself subscribed.
    pub fn publish(
        &self,
        sender: Option<&PeerHandle>,
        topic: &str,
        frame: &Frame,
        options: PublishOptions,
    ) -> Delivery {
        let frame = Frame::new(frame.text.clone(), options.compress);
        let mut delivery = Delivery::default();

        if options.to_sender
            && let Some(sender) = sender
        {
            delivery.record(sender.send(frame.clone()));
        }

        let sender_id = sender.map(|s| s.id());
        for peer in self.registry.subscribers_of(topic) {
            if Some(peer.id()) == sender_id {
                continue;
            }
            delivery.record(peer.send(frame.clone()));
        }

        debug!(
            "Published to {}: {} sent, {} dropped",
            topic, delivery.sent, delivery.dropped
        );
        delivery
    }

    /// The first connected peer, in connect order, subscribed to `topic`.
    ///
    /// The choice only changes when the registry mutates, so every caller
    /// that asks within the same generation agrees on the same peer.
    pub fn elect(&self, topic: &str) -> Option<PeerHandle> {
        self.registry
            .all_peers()
            .find(|peer| self.registry.is_subscribed(peer.id(), topic))
    }

    /// Single-flight broadcast: the elected peer sends the frame to itself
    /// and publishes it to the other subscribers. Returns the elected peer.
    pub fn broadcast_once(&self, topic: &str, frame: &Frame) -> Option<(PeerHandle, Delivery)> {
        let elected = self.elect(topic)?;
        let delivery = self.deliver_as(&elected, topic, frame);
        Some((elected, delivery))
    }

    /// Single-flight broadcast on behalf of `peer`.
    ///
    /// Only acts when `peer` is the elected sender for `topic`; every other
    /// caller is a no-op and gets `None`. Used when each local peer receives
    /// the same external event and exactly one of them should fan it out.
    pub fn broadcast_from(&self, peer: &PeerHandle, topic: &str, frame: &Frame) -> Option<Delivery> {
        let elected = self.elect(topic)?;
        if elected.id() != peer.id() {
            return None;
        }
        Some(self.deliver_as(&elected, topic, frame))
    }

    fn deliver_as(&self, elected: &PeerHandle, topic: &str, frame: &Frame) -> Delivery {
        let mut delivery = Delivery::default();
        delivery.record(elected.send(frame.clone()));
        delivery.absorb(self.publish(
            Some(elected),
            topic,
            frame,
            PublishOptions {
                to_sender: false,
                compress: frame.compress,
            },
        ));
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerId;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        broadcaster: Broadcaster,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(SubscriptionRegistry::new());
            Self {
                broadcaster: Broadcaster::new(registry.clone()),
                registry,
            }
        }

        fn peer(&self, id: &str, topics: &[&str]) -> (PeerHandle, mpsc::Receiver<Frame>) {
            let (handle, rx) = PeerHandle::channel(PeerId::from(id), 16);
            self.registry.attach(handle.clone());
            for topic in topics {
                self.registry.subscribe(handle.id(), topic);
            }
            (handle, rx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame.as_str().to_string());
        }
        out
    }

    #[test]
    fn test_publish_excludes_sender_by_default() {
        let f = Fixture::new();
        let (a, mut rx_a) = f.peer("a", &["t"]);
        let (_b, mut rx_b) = f.peer("b", &["t"]);
        let (_c, mut rx_c) = f.peer("c", &["other"]);

        let delivery = f
            .broadcaster
            .publish(Some(&a), "t", &Frame::compressed("hi"), PublishOptions::default());

        assert_eq!(delivery, Delivery { sent: 1, dropped: 0 });
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec!["hi"]);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_publish_to_sender_delivers_once() {
        let f = Fixture::new();
        let (a, mut rx_a) = f.peer("a", &["t"]);
        let (_b, mut rx_b) = f.peer("b", &["t"]);

        f.broadcaster
            .publish(Some(&a), "t", &Frame::compressed("hi"), PublishOptions::to_sender());

        assert_eq!(drain(&mut rx_a), vec!["hi"]);
        assert_eq!(drain(&mut rx_b), vec!["hi"]);
    }

    #[test]
    fn test_publish_to_unsubscribed_sender() {
        let f = Fixture::new();
        let (a, mut rx_a) = f.peer("a", &[]);
        let (_b, mut rx_b) = f.peer("b", &["t"]);

        f.broadcaster
            .publish(Some(&a), "t", &Frame::compressed("hi"), PublishOptions::to_sender());

        assert_eq!(drain(&mut rx_a), vec!["hi"]);
        assert_eq!(drain(&mut rx_b), vec!["hi"]);
    }

    #[test]
    fn test_full_queue_counts_as_dropped() {
        let f = Fixture::new();
        let (handle, _rx) = PeerHandle::channel(PeerId::from("slow"), 1);
        f.registry.attach(handle.clone());
        f.registry.subscribe(handle.id(), "t");

        let frame = Frame::compressed("x");
        f.broadcaster.publish(None, "t", &frame, PublishOptions::default());
        let delivery = f.broadcaster.publish(None, "t", &frame, PublishOptions::default());

        assert_eq!(delivery, Delivery { sent: 0, dropped: 1 });
    }

    #[test]
    fn test_election_is_first_subscribed_peer_in_connect_order() {
        let f = Fixture::new();
        let (_a, _ra) = f.peer("a", &["other"]);
        let (_b, _rb) = f.peer("b", &[]);
        let (c, _rc) = f.peer("c", &["t"]);
        let b_id = PeerId::from("b");

        assert_eq!(f.broadcaster.elect("t").unwrap().id().as_str(), "c");

        // b connected before c, so it wins as soon as it subscribes.
        f.registry.subscribe(&b_id, "t");
        assert_eq!(f.broadcaster.elect("t").unwrap().id().as_str(), "b");

        f.registry.detach(&b_id);
        assert_eq!(f.broadcaster.elect("t").unwrap().id(), c.id());
        assert!(f.broadcaster.elect("nobody").is_none());
    }

    #[test]
    fn test_election_stable_within_generation() {
        let f = Fixture::new();
        let _peers: Vec<_> = ["a", "b", "c"].iter().map(|id| f.peer(id, &["t"])).collect();
        let generation = f.registry.generation();
        let first = f.broadcaster.elect("t").unwrap();
        let second = f.broadcaster.elect("t").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(f.registry.generation(), generation);
    }

    #[test]
    fn test_broadcast_from_every_peer_delivers_exactly_once() {
        let f = Fixture::new();
        let (a, mut rx_a) = f.peer("a", &["t"]);
        let (b, mut rx_b) = f.peer("b", &["t"]);
        let (c, mut rx_c) = f.peer("c", &["t"]);
        let frame = Frame::compressed("event");

        let acted: Vec<bool> = [&a, &b, &c]
            .iter()
            .map(|p| f.broadcaster.broadcast_from(p, "t", &frame).is_some())
            .collect();

        assert_eq!(acted, vec![true, false, false]);
        assert_eq!(drain(&mut rx_a), vec!["event"]);
        assert_eq!(drain(&mut rx_b), vec!["event"]);
        assert_eq!(drain(&mut rx_c), vec!["event"]);
    }

    #[test]
    fn test_broadcast_once_without_subscribers() {
        let f = Fixture::new();
        let (_a, mut rx_a) = f.peer("a", &["x"]);
        assert!(f.broadcaster.broadcast_once("t", &Frame::compressed("e")).is_none());
        assert!(drain(&mut rx_a).is_empty());
    }
}
