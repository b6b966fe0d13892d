//! Subscription Manager (§4.6): the bipartite outgoing/incoming
//! subscription tables and the zero/one subscriber-count transitions that
//! drive publisher start/stop.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use meshrpc_core::peer::Peer;

/// A user-supplied P+S receive-handler, invoked for every push received
/// from a publisher this peer is subscribed to.
pub type ReceiveHandler = Arc<dyn Fn(Peer, Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A local outgoing subscription to a remote publisher (§3 "Subscription
/// (local side)"). Unique by `(peer.UUID, commandName)`.
pub struct OutgoingSubscription {
    pub configuration: Option<Value>,
    pub receive_handler: ReceiveHandler,
}

/// A remote peer subscribed to one of our published P+S commands (§3
/// "Subscriber entry"). Unique by `(commandName, peer.UUID)`.
#[derive(Debug, Clone)]
pub struct IncomingSubscriber {
    pub udp_port: Option<u16>,
    pub configuration: Option<Value>,
}

#[derive(Default)]
pub struct SubscriptionManager {
    outgoing: tokio::sync::Mutex<HashMap<(Uuid, String), OutgoingSubscription>>,
    incoming: tokio::sync::Mutex<HashMap<(String, Uuid), IncomingSubscriber>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) an outgoing subscription. A repeated
    /// `subscribe` for the same `(peer, command)` coalesces: it replaces
    /// the receive-handler rather than opening a second entry (§8
    /// round-trip law).
    pub async fn insert_outgoing(&self, peer_uuid: Uuid, command_name: String, entry: OutgoingSubscription) {
        self.outgoing.lock().await.insert((peer_uuid, command_name), entry);
    }

    pub async fn remove_outgoing(&self, peer_uuid: Uuid, command_name: &str) -> Option<OutgoingSubscription> {
        self.outgoing.lock().await.remove(&(peer_uuid, command_name.to_string()))
    }

    pub async fn has_outgoing(&self, peer_uuid: Uuid, command_name: &str) -> bool {
        self.outgoing.lock().await.contains_key(&(peer_uuid, command_name.to_string()))
    }

    pub async fn receive_handler(&self, peer_uuid: Uuid, command_name: &str) -> Option<ReceiveHandler> {
        self.outgoing
            .lock()
            .await
            .get(&(peer_uuid, command_name.to_string()))
            .map(|e| Arc::clone(&e.receive_handler))
    }

    /// Every command name this peer is subscribed to; used by
    /// `unsubscribe(*)` and peer-removal teardown.
    pub async fn outgoing_commands_for_peer(&self, peer_uuid: Uuid) -> Vec<String> {
        self.outgoing
            .lock()
            .await
            .keys()
            .filter(|(p, _)| *p == peer_uuid)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Record a subscriber, returning `true` if it was the command's first
    /// (the publisher must be `start()`ed).
    pub async fn insert_incoming(&self, command_name: String, peer_uuid: Uuid, entry: IncomingSubscriber) -> bool {
        let mut incoming = self.incoming.lock().await;
        let was_empty = !incoming.keys().any(|(c, _)| *c == command_name);
        incoming.insert((command_name, peer_uuid), entry);
        was_empty
    }

    /// Remove a subscriber, returning `(removed, now_empty)`. `removed` is
    /// `false` if the entry wasn't present; `now_empty` is `true` if this
    /// was the command's last subscriber (the publisher must `stop()`).
    pub async fn remove_incoming(&self, command_name: &str, peer_uuid: Uuid) -> (bool, bool) {
        let mut incoming = self.incoming.lock().await;
        let removed = incoming.remove(&(command_name.to_string(), peer_uuid)).is_some();
        let now_empty = !incoming.keys().any(|(c, _)| c == command_name);
        (removed, now_empty)
    }

    pub async fn subscriber_count(&self, command_name: &str) -> usize {
        self.incoming.lock().await.keys().filter(|(c, _)| c == command_name).count()
    }

    pub async fn subscribers_for_command(&self, command_name: &str) -> Vec<Uuid> {
        self.incoming
            .lock()
            .await
            .keys()
            .filter(|(c, _)| c == command_name)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Every `(commandName, wasLastSubscriber)` removed for a departing
    /// peer; used by peer-removal and `unpublish` teardown.
    pub async fn remove_all_incoming_for_peer(&self, peer_uuid: Uuid) -> Vec<(String, bool)> {
        let mut incoming = self.incoming.lock().await;
        let commands: Vec<String> = incoming.keys().filter(|(_, p)| *p == peer_uuid).map(|(c, _)| c.clone()).collect();
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            incoming.remove(&(command.clone(), peer_uuid));
            let now_empty = !incoming.keys().any(|(c, _)| *c == command);
            results.push((command, now_empty));
        }
        results
    }

    /// Every command name removed for a command that was just unpublished,
    /// regardless of peer; used by `CommandRegistry::unpublish`.
    pub async fn remove_all_incoming_for_command(&self, command_name: &str) -> Vec<Uuid> {
        let mut incoming = self.incoming.lock().await;
        let peers: Vec<Uuid> = incoming.keys().filter(|(c, _)| c == command_name).map(|(_, p)| *p).collect();
        for peer in &peers {
            incoming.remove(&(command_name.to_string(), *peer));
        }
        peers
    }

    pub async fn remove_all_outgoing_for_peer(&self, peer_uuid: Uuid) -> Vec<String> {
        let mut outgoing = self.outgoing.lock().await;
        let commands: Vec<String> = outgoing.keys().filter(|(p, _)| *p == peer_uuid).map(|(_, c)| c.clone()).collect();
        for command in &commands {
            outgoing.remove(&(peer_uuid, command.clone()));
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> ReceiveHandler {
        Arc::new(|_peer, _params| Box::pin(async {}))
    }

    #[tokio::test]
    async fn first_subscriber_reported_as_empty_transition() {
        let manager = SubscriptionManager::new();
        let peer = Uuid::new_v4();
        let was_first = manager
            .insert_incoming("motion".into(), peer, IncomingSubscriber { udp_port: None, configuration: None })
            .await;
        assert!(was_first);

        let second_peer = Uuid::new_v4();
        let was_first_again = manager
            .insert_incoming("motion".into(), second_peer, IncomingSubscriber { udp_port: None, configuration: None })
            .await;
        assert!(!was_first_again);
    }

    #[tokio::test]
    async fn last_subscriber_removal_reported_as_now_empty() {
        let manager = SubscriptionManager::new();
        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();
        manager.insert_incoming("motion".into(), peer_a, IncomingSubscriber { udp_port: None, configuration: None }).await;
        manager.insert_incoming("motion".into(), peer_b, IncomingSubscriber { udp_port: None, configuration: None }).await;

        let (removed, now_empty) = manager.remove_incoming("motion", peer_a).await;
        assert!(removed);
        assert!(!now_empty);

        let (removed, now_empty) = manager.remove_incoming("motion", peer_b).await;
        assert!(removed);
        assert!(now_empty);
    }

    #[tokio::test]
    async fn repeated_subscribe_coalesces_into_single_entry() {
        let manager = SubscriptionManager::new();
        let peer = Uuid::new_v4();
        manager
            .insert_outgoing(peer, "kv".into(), OutgoingSubscription { configuration: None, receive_handler: noop_handler() })
            .await;
        manager
            .insert_outgoing(peer, "kv".into(), OutgoingSubscription { configuration: None, receive_handler: noop_handler() })
            .await;
        assert_eq!(manager.outgoing_commands_for_peer(peer).await.len(), 1);
    }

    #[tokio::test]
    async fn remove_all_incoming_for_peer_reports_emptied_commands() {
        let manager = SubscriptionManager::new();
        let peer = Uuid::new_v4();
        manager.insert_incoming("motion".into(), peer, IncomingSubscriber { udp_port: None, configuration: None }).await;
        manager.insert_incoming("loc".into(), peer, IncomingSubscriber { udp_port: None, configuration: None }).await;

        let mut removed = manager.remove_all_incoming_for_peer(peer).await;
        removed.sort();
        assert_eq!(removed, vec![("loc".to_string(), true), ("motion".to_string(), true)]);
    }
}
