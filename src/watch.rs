//! Routing of backend watch-fired events to their owning clients.
//!
//! A watch is one client's registered interest in idle/active transitions.
//! The router owns the watch-id → owner mapping and guarantees an event is
//! only ever delivered to the client that registered the watch. Broadcasting
//! would leak one application's idle-state interest to every peer on the
//! bus, so an event for an unknown watch is dropped, never guessed at.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{VarMap, Variant};

/// Key under which the backend reports the fired watch id.
///
/// Wire-fixed; the backend sends `a{sv}` state with this entry as a u32.
const SESSION_STATE_KEY: &str = "session-state";

/// Delivery channel for watch events, one per owning client.
#[async_trait]
pub trait WatchSink: Send + Sync {
    /// Notify the owning client that its watch fired.
    async fn watch_fired(&self, watch_id: u32);
}

/// Errors from watch registration.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watch id {0} is already registered")]
    DuplicateId(u32),
}

struct WatchEntry {
    /// Unique bus name of the owning client connection.
    owner: String,
    sink: Arc<dyn WatchSink>,
    active: bool,
}

/// Maps backend watch identifiers to their owning client sessions.
pub struct WatchRouter {
    watches: Mutex<HashMap<u32, WatchEntry>>,
}

impl WatchRouter {
    pub fn new() -> Self {
        Self {
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Register a watch for the given owner.
    ///
    /// Watch ids are unique across the router; registering an id that is
    /// still live is an error rather than a silent re-bind.
    pub fn register_watch(
        &self,
        watch_id: u32,
        owner: &str,
        sink: Arc<dyn WatchSink>,
    ) -> Result<(), WatchError> {
        let mut watches = self.map();
        if watches.contains_key(&watch_id) {
            return Err(WatchError::DuplicateId(watch_id));
        }
        watches.insert(
            watch_id,
            WatchEntry {
                owner: owner.to_string(),
                sink,
                active: true,
            },
        );
        Ok(())
    }

    /// Remove a watch. Returns true if it existed.
    pub fn remove_watch(&self, watch_id: u32) -> bool {
        self.map().remove(&watch_id).is_some()
    }

    /// Drop every watch owned by a client session that ended.
    pub fn remove_session(&self, owner: &str) -> usize {
        let mut watches = self.map();
        let before = watches.len();
        watches.retain(|_, entry| entry.owner != owner);
        before - watches.len()
    }

    /// Number of live watches.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Route one backend watch-fired event to its owner.
    ///
    /// Runs on the shared signal-dispatch path: a map lookup and a targeted
    /// sink call, nothing that blocks on the backend or the permission store.
    pub async fn deliver(&self, session_id: &str, state: &VarMap) {
        let Some(watch_id) = state.get(SESSION_STATE_KEY).and_then(Variant::as_u32) else {
            warn!(
                "Watch-fired event for {} carries no usable session-state; dropping",
                session_id
            );
            return;
        };

        debug!("Received watch-fired {}: watch-id: {}", session_id, watch_id);

        let sink = {
            let watches = self.map();
            match watches.get(&watch_id) {
                Some(entry) if entry.active => Arc::clone(&entry.sink),
                Some(_) => {
                    debug!("Watch {} is inactive; dropping event", watch_id);
                    return;
                }
                None => {
                    warn!("Watch-fired event for unknown watch {}; dropping", watch_id);
                    return;
                }
            }
        };

        sink.watch_fired(watch_id).await;
    }

    fn map(&self) -> MutexGuard<'_, HashMap<u32, WatchEntry>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for WatchRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Variant;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<u32>);

    #[async_trait]
    impl WatchSink for ChannelSink {
        async fn watch_fired(&self, watch_id: u32) {
            let _ = self.0.send(watch_id);
        }
    }

    fn sink() -> (Arc<dyn WatchSink>, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }

    fn fired_state(watch_id: u32) -> VarMap {
        let mut state = VarMap::new();
        state.insert("session-state".to_string(), Variant::U32(watch_id));
        state
    }

    #[tokio::test]
    async fn test_event_reaches_only_the_owner() {
        let router = WatchRouter::new();
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();
        router.register_watch(1, ":1.1", sink_a).unwrap();
        router.register_watch(2, ":1.2", sink_b).unwrap();

        router.deliver("session0", &fired_state(1)).await;

        assert_eq!(rx_a.try_recv().unwrap(), 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_watch_is_dropped() {
        let router = WatchRouter::new();
        let (sink_a, mut rx_a) = sink();
        router.register_watch(1, ":1.1", sink_a).unwrap();

        router.deliver("session0", &fired_state(99)).await;

        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removed_watch_no_longer_fires() {
        let router = WatchRouter::new();
        let (sink_a, mut rx_a) = sink();
        router.register_watch(1, ":1.1", sink_a).unwrap();
        assert!(router.remove_watch(1));

        router.deliver("session0", &fired_state(1)).await;

        assert!(rx_a.try_recv().is_err());
        assert!(!router.remove_watch(1));
    }

    #[tokio::test]
    async fn test_malformed_state_is_dropped() {
        let router = WatchRouter::new();
        let (sink_a, mut rx_a) = sink();
        router.register_watch(1, ":1.1", sink_a).unwrap();

        // No session-state key at all.
        router.deliver("session0", &VarMap::new()).await;
        // Wrong type under the key.
        let mut state = VarMap::new();
        state.insert("session-state".to_string(), Variant::Str("1".to_string()));
        router.deliver("session0", &state).await;

        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let router = WatchRouter::new();
        let (sink_a, _rx_a) = sink();
        let (sink_b, _rx_b) = sink();
        router.register_watch(1, ":1.1", sink_a).unwrap();
        assert!(matches!(
            router.register_watch(1, ":1.2", sink_b),
            Err(WatchError::DuplicateId(1))
        ));
    }

    #[tokio::test]
    async fn test_remove_session_drops_all_of_an_owners_watches() {
        let router = WatchRouter::new();
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();
        router.register_watch(1, ":1.1", Arc::clone(&sink_a)).unwrap();
        router.register_watch(2, ":1.1", sink_a).unwrap();
        router.register_watch(3, ":1.2", sink_b).unwrap();

        assert_eq!(router.remove_session(":1.1"), 2);
        assert_eq!(router.len(), 1);

        router.deliver("session0", &fired_state(2)).await;
        router.deliver("session0", &fired_state(3)).await;

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_events_for_same_watch_keep_order() {
        let router = WatchRouter::new();
        let (sink_a, mut rx_a) = sink();
        router.register_watch(1, ":1.1", sink_a).unwrap();

        for _ in 0..3 {
            router.deliver("session0", &fired_state(1)).await;
        }

        assert_eq!(rx_a.try_recv().unwrap(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), 1);
        assert!(rx_a.try_recv().is_err());
    }
}
