//! Named-event hook bus.
//!
//! External collaborators (an HTTP handler, a timer, another subsystem) use
//! [`HookBus::trigger`] to push messages into the broadcast path without
//! going through the client protocol. Every open connection registers one
//! listener for [`TOPIC_PUBLISH`] and releases it on close through the
//! [`HookHandle`] it got back from [`HookBus::on`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Event carrying out-of-band publishes.
pub const TOPIC_PUBLISH: &str = "topic-publish";

/// One message passed to a hook trigger. Both fields are optional on the
/// wire; messages missing either are skipped before listeners run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookMessage {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl HookMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: Some(payload),
        }
    }

    /// `(topic, payload)` when both are present.
    pub fn parts(&self) -> Option<(&str, &Value)> {
        Some((self.topic.as_deref()?, self.payload.as_ref()?))
    }
}

pub type Listener = Arc<dyn Fn(&[HookMessage]) + Send + Sync>;

/// Registration receipt. Pass it back to [`HookBus::off`] to unregister.
#[must_use = "dropping a HookHandle without calling HookBus::off leaks the listener"]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookHandle {
    event: String,
    id: u64,
}

impl HookHandle {
    pub fn event(&self) -> &str {
        &self.event
    }
}

#[derive(Default)]
pub struct HookBus {
    listeners: RwLock<HashMap<String, IndexMap<u64, Listener>>>,
    next_id: AtomicU64,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> HookHandle
    where
        F: Fn(&[HookMessage]) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .insert(id, Arc::new(listener));
        HookHandle {
            event: event.to_string(),
            id,
        }
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    pub fn off(&self, handle: &HookHandle) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(registered) = listeners.get_mut(&handle.event) else {
            return false;
        };
        let removed = registered.shift_remove(&handle.id).is_some();
        if registered.is_empty() {
            listeners.remove(&handle.event);
        }
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Call every listener for `event`, in registration order, with the
    /// messages that carry both a topic and a payload.
    ///
    /// Listeners run on the caller's thread after the registry lock is
    /// released, so a listener may itself call `on`/`off`. Returns how many
    /// listeners ran.
    pub fn trigger(&self, event: &str, messages: &[HookMessage]) -> usize {
        let messages: Vec<HookMessage> = messages
            .iter()
            .filter(|m| m.parts().is_some())
            .cloned()
            .collect();
        if messages.is_empty() {
            debug!("Hook '{}' triggered without usable messages", event);
            return 0;
        }

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(|l| l.values().cloned().collect())
            .unwrap_or_default();

        for listener in &listeners {
            listener(&messages);
        }
        listeners.len()
    }
}
