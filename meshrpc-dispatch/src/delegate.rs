//! Connector and discovery-filter delegate traits (§9 "delegate-protocol
//! polymorphism"): receiver-style notification objects. The source carries
//! the same protocol twice under different method-name prefixes
//! (`connector:` / `threeMF:`); this crate exposes one `ConnectorDelegate`
//! surface instead.

use std::collections::HashSet;

use async_trait::async_trait;
use meshrpc_core::error::Error;
use meshrpc_core::peer::Peer;
use uuid::Uuid;

/// Facade-wide lifecycle notifications. Every method has a no-op default;
/// implementers override only the events they care about.
#[async_trait]
pub trait ConnectorDelegate: Send + Sync {
    async fn did_add_peer(&self, _peer: Peer) {}
    async fn did_update_peer(&self, _peer: Peer, _previous_capabilities: HashSet<String>) {}
    async fn will_remove_peer(&self, _peer_uuid: Uuid) {}
    async fn did_fail_with_error(&self, _channel: String, _error: Error) {}
    async fn did_add_subscriber(&self, _command_name: String, _peer: Peer) {}
    async fn did_remove_subscriber(&self, _command_name: String, _peer_uuid: Uuid) {}
    async fn did_add_subscription(&self, _command_name: String, _peer: Peer) {}
    async fn did_remove_subscription(&self, _command_name: String, _peer_uuid: Uuid) {}
}

/// A no-op delegate for hosts that only care about a subset of events and
/// want to skip writing an impl.
pub struct NullConnectorDelegate;

impl ConnectorDelegate for NullConnectorDelegate {}

/// One entry of a `start_discovery(required_capabilities, ...)` filter
/// transition (§4.7 "Discovery filtering").
#[derive(Debug, Clone)]
pub enum DiscoveringPeerChange {
    Found(Peer),
    Updated(Peer),
    Removed(Uuid),
}

#[async_trait]
pub trait DiscoveringPeersDelegate: Send + Sync {
    async fn did_change_discovering_peer(&self, change: DiscoveringPeerChange);
}
