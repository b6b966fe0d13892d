//! Pending-callback table (§3, invariant 1: uniquely keyed by
//! `(channel, peer.UUID, id)`).
//!
//! A response is delivered by completing a `tokio::sync::oneshot` channel
//! registered at request time. Timeouts and connection teardown both race
//! against the same oneshot via `tokio::time::timeout` at the call site;
//! either way the entry is removed exactly once.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use meshrpc_core::error::{Error, Result};

/// Identifies which channel instance a pending request belongs to, so ids
/// allocated on the system channel never collide with ids allocated on a
/// per-command reliable channel.
pub type ChannelId = String;

type Key = (ChannelId, Uuid, u32);

/// Table of outstanding R+R requests awaiting a response.
pub struct PendingCallbacks {
    inner: Mutex<HashMap<Key, oneshot::Sender<Result<Value>>>>,
}

impl Default for PendingCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCallbacks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Install a new pending entry, returning the receiver half the caller
    /// awaits (with its own timeout).
    pub fn register(&self, channel: ChannelId, peer: Uuid, id: u32) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("pending callback table poisoned");
        inner.insert((channel, peer, id), tx);
        rx
    }

    /// Complete a pending entry with a response. Returns `false` if no such
    /// entry existed (late or unknown response, e.g. after timeout already
    /// fired) - a no-op in that case.
    pub fn complete(&self, channel: &str, peer: Uuid, id: u32, result: Result<Value>) -> bool {
        let mut inner = self.inner.lock().expect("pending callback table poisoned");
        if let Some(tx) = inner.remove(&(channel.to_string(), peer, id)) {
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }

    /// Remove a single entry without completing it (used when the caller
    /// itself times out, so a late response finds nothing to complete).
    pub fn remove(&self, channel: &str, peer: Uuid, id: u32) {
        let mut inner = self.inner.lock().expect("pending callback table poisoned");
        inner.remove(&(channel.to_string(), peer, id));
    }

    /// Fail every pending entry for a peer with `CONNECTION_CLOSED`,
    /// returning how many were completed (§8 boundary behavior: "a
    /// connection drop with N pending responses completes exactly N
    /// callbacks with CONNECTION_CLOSED").
    pub fn fail_all_for_peer(&self, channel: &str, peer: Uuid) -> usize {
        let mut inner = self.inner.lock().expect("pending callback table poisoned");
        let keys: Vec<Key> = inner
            .keys()
            .filter(|(c, p, _)| c == channel && *p == peer)
            .cloned()
            .collect();
        let mut completed = 0;
        for key in keys {
            if let Some(tx) = inner.remove(&key) {
                let _ = tx.send(Err(Error::ConnectionClosed));
                completed += 1;
            }
        }
        completed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending callback table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_to_registered_receiver() {
        let table = PendingCallbacks::new();
        let peer = Uuid::new_v4();
        let rx = table.register("system".into(), peer, 1);
        assert!(table.complete("system", peer, 1, Ok(Value::Bool(true))));
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn complete_on_unknown_key_is_noop() {
        let table = PendingCallbacks::new();
        assert!(!table.complete("system", Uuid::new_v4(), 99, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn fail_all_for_peer_completes_only_matching_entries() {
        let table = PendingCallbacks::new();
        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();
        let rx_a1 = table.register("system".into(), peer_a, 1);
        let rx_a2 = table.register("system".into(), peer_a, 2);
        let rx_b = table.register("system".into(), peer_b, 1);

        let n = table.fail_all_for_peer("system", peer_a);
        assert_eq!(n, 2);
        assert!(matches!(rx_a1.await.unwrap().unwrap_err(), Error::ConnectionClosed));
        assert!(matches!(rx_a2.await.unwrap().unwrap_err(), Error::ConnectionClosed));
        assert_eq!(table.len(), 1);
        drop(rx_b);
    }
}
