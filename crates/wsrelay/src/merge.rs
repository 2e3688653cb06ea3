//! Merge strategies for topic records.
//!
//! A publish is a read-modify-write: the relay reads the stored record (or
//! [`MergeStrategy::empty`] when there is none), folds the incoming payload
//! into it, writes the result back and broadcasts it. When a peer leaves a
//! topic, [`MergeStrategy::without_peer`] strips whatever that peer
//! contributed.

use serde_json::{Map, Value};

use crate::registry::PeerId;

pub trait MergeStrategy: Send + Sync {
    /// The record a topic starts from.
    fn empty(&self) -> Value;

    /// Fold `incoming` from `peer` into the current record.
    fn merge(&self, current: Value, incoming: &Value, peer: &PeerId) -> Value;

    /// The record with `peer`'s contribution removed, or `None` when the
    /// record holds nothing attributable to `peer`.
    fn without_peer(&self, _current: &Value, _peer: &PeerId) -> Option<Value> {
        None
    }
}

/// Shallow object merge: incoming keys overwrite stored keys.
///
/// A non-object payload leaves the record unchanged, and a stored record
/// that is not an object is treated as empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectSpread;

impl MergeStrategy for ObjectSpread {
    fn empty(&self) -> Value {
        Value::Object(Map::new())
    }

    fn merge(&self, current: Value, incoming: &Value, _peer: &PeerId) -> Value {
        let mut record = match current {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Value::Object(fields) = incoming {
            for (key, value) in fields {
                record.insert(key.clone(), value.clone());
            }
        }
        Value::Object(record)
    }
}

/// A list with one entry per peer, each tagged with the peer's id under
/// `key`. Publishing upserts the sender's entry in place; new senders are
/// appended.
#[derive(Debug, Clone)]
pub struct PeerList {
    pub key: String,
}

impl Default for PeerList {
    fn default() -> Self {
        Self {
            key: "peerId".to_string(),
        }
    }
}

impl PeerList {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    fn owned_by(&self, entry: &Value, peer: &PeerId) -> bool {
        entry.get(&self.key).and_then(Value::as_str) == Some(peer.as_str())
    }

    fn entry(&self, incoming: &Value, peer: &PeerId) -> Value {
        let mut entry = match incoming {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        entry.insert(self.key.clone(), Value::String(peer.to_string()));
        Value::Object(entry)
    }
}

impl MergeStrategy for PeerList {
    fn empty(&self) -> Value {
        Value::Array(Vec::new())
    }

    fn merge(&self, current: Value, incoming: &Value, peer: &PeerId) -> Value {
        let mut entries = match current {
            Value::Array(entries) => entries,
            _ => Vec::new(),
        };
        let entry = self.entry(incoming, peer);
        match entries.iter().position(|e| self.owned_by(e, peer)) {
            Some(index) => entries[index] = entry,
            None => entries.push(entry),
        }
        Value::Array(entries)
    }

    fn without_peer(&self, current: &Value, peer: &PeerId) -> Option<Value> {
        let entries = current.as_array()?;
        let kept: Vec<Value> = entries
            .iter()
            .filter(|e| !self.owned_by(e, peer))
            .cloned()
            .collect();
        (kept.len() != entries.len()).then_some(Value::Array(kept))
    }
}

/// Last publish wins outright.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replace;

impl MergeStrategy for Replace {
    fn empty(&self) -> Value {
        Value::Null
    }

    fn merge(&self, _current: Value, incoming: &Value, _peer: &PeerId) -> Value {
        incoming.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[test]
    fn test_object_spread_overwrites_by_key() {
        let merged = ObjectSpread.merge(json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}), &peer("p"));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_object_spread_edge_cases() {
        let s = ObjectSpread;
        assert_eq!(s.merge(s.empty(), &json!({"a": 1}), &peer("p")), json!({"a": 1}));
        assert_eq!(s.merge(json!([1]), &json!({"a": 1}), &peer("p")), json!({"a": 1}));
        assert_eq!(s.merge(json!({"a": 1}), &json!(7), &peer("p")), json!({"a": 1}));
        assert_eq!(s.without_peer(&json!({"a": 1}), &peer("p")), None);
    }

    #[test]
    fn test_peer_list_upserts_in_place() {
        let list = PeerList::default();
        let record = list.merge(list.empty(), &json!({"x": 1, "y": 2}), &peer("a"));
        assert_eq!(record, json!([{"x": 1, "y": 2, "peerId": "a"}]));

        let record = list.merge(record, &json!({"x": 5, "y": 5}), &peer("b"));
        let record = list.merge(record, &json!({"x": 9, "y": 9}), &peer("a"));
        assert_eq!(
            record,
            json!([
                {"x": 9, "y": 9, "peerId": "a"},
                {"x": 5, "y": 5, "peerId": "b"}
            ])
        );
    }

    #[test]
    fn test_peer_list_cannot_spoof_owner() {
        let list = PeerList::default();
        let record = list.merge(list.empty(), &json!({"x": 1, "peerId": "someone-else"}), &peer("a"));
        assert_eq!(record, json!([{"x": 1, "peerId": "a"}]));
    }

    #[test]
    fn test_peer_list_wraps_scalars() {
        let list = PeerList::new("owner");
        let record = list.merge(list.empty(), &json!("hello"), &peer("a"));
        assert_eq!(record, json!([{"value": "hello", "owner": "a"}]));
    }

    #[test]
    fn test_peer_list_without_peer() {
        let list = PeerList::default();
        let record = json!([{"x": 1, "peerId": "a"}, {"x": 2, "peerId": "b"}]);

        assert_eq!(list.without_peer(&record, &peer("a")), Some(json!([{"x": 2, "peerId": "b"}])));
        assert_eq!(list.without_peer(&record, &peer("c")), None);
        assert_eq!(list.without_peer(&json!({"a": 1}), &peer("a")), None);
    }

    #[test]
    fn test_replace() {
        assert_eq!(Replace.merge(json!({"a": 1}), &json!([1]), &peer("p")), json!([1]));
        assert_eq!(Replace.empty(), Value::Null);
    }
}
