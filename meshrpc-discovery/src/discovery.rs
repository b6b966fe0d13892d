use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use meshrpc_core::error::{Error, Result};
use meshrpc_core::peer::{txt_keys, Peer};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notifications the discovery layer emits as peers move through their
/// lifecycle (§4.4, §3 "Lifecycle summary"). The dispatcher consumes these
/// to drive `ConnectorDelegate` callbacks and the subscription manager's
/// capability-loss teardown.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer completed the heartbeat handshake for the first time.
    Added(Peer),
    /// A previously-visible peer's TXT or address changed.
    Updated { peer: Peer, previous_capabilities: HashSet<String> },
    /// A peer's grace period expired (or its heartbeat went stale) with no
    /// reappearance; the record is destroyed.
    Removed(Uuid),
}

/// Performs the `_hb` handshake used to gate peer visibility (§4.4 step 5).
/// Implemented by the dispatcher, which owns the reliable system channel;
/// discovery never sends RPC traffic itself.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send_heartbeat(&self, peer: &Peer) -> Result<()>;
}

/// Static configuration for one discovery instance (§6 "Configuration
/// delegate" knobs relevant to this layer).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub local_uuid: Uuid,
    pub protocol_identifier: String,
    pub instance_name: String,
    pub service_type: String,
    pub service_domain: String,
    pub heartbeat_grace: Duration,
    pub heartbeat_interval: Duration,
}

struct TrackedPeer {
    peer: Peer,
    last_heartbeat_at: Instant,
    withdrawn_since: Option<Instant>,
}

struct DiscoveryState {
    /// Resolved but not yet heartbeat-confirmed; never reported to callers.
    pending: HashMap<Uuid, Peer>,
    /// Heartbeat-confirmed peers, possibly mid-grace-period.
    visible: HashMap<Uuid, TrackedPeer>,
    /// mDNS fullname -> uuid, populated on first resolve so a bare
    /// `ServiceRemoved(ty, fullname)` event (no TXT) can be matched back.
    fullname_to_uuid: HashMap<String, Uuid>,
}

/// Owns the `mdns-sd` service daemon: publishes the local peer's TXT
/// record, browses for others, and runs the heartbeat-gated visibility
/// state machine (§4.4).
pub struct Discovery {
    config: DiscoveryConfig,
    /// Created lazily in `start()` (not `new()`) so construction of this
    /// type can never fail: the dispatcher builds its whole component
    /// graph, including this discovery instance, inside `Arc::new_cyclic`,
    /// where a fallible step would have nowhere natural to propagate an
    /// error. Bind-style failures surface from `start()` instead, the same
    /// place `Channel::start()` surfaces `CHANNEL_BIND_FAILED`.
    mdns: Mutex<Option<ServiceDaemon>>,
    heartbeat_sink: Arc<dyn HeartbeatSink>,
    state: Arc<Mutex<DiscoveryState>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    fullname: Mutex<Option<String>>,
    browse_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, heartbeat_sink: Arc<dyn HeartbeatSink>) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let discovery = Self {
            config,
            mdns: Mutex::new(None),
            heartbeat_sink,
            state: Arc::new(Mutex::new(DiscoveryState {
                pending: HashMap::new(),
                visible: HashMap::new(),
                fullname_to_uuid: HashMap::new(),
            })),
            events_tx,
            fullname: Mutex::new(None),
            browse_task: Mutex::new(None),
            sweep_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
        };
        (discovery, events_rx)
    }

    /// Publish the local service + TXT, start browsing, and start the
    /// grace-sweep and periodic re-heartbeat background tasks.
    pub async fn start(
        &self,
        system_port: u16,
        capabilities: &HashSet<String>,
        port_by_command_name: &HashMap<String, u16>,
        local_addr: IpAddr,
    ) -> Result<()> {
        let mdns = ServiceDaemon::new().map_err(|e| Error::ChannelBindFailed(e.to_string()))?;
        let receiver = mdns
            .browse(&self.config.service_type)
            .map_err(|e| Error::ChannelBindFailed(e.to_string()))?;
        *self.mdns.lock().await = Some(mdns);

        self.publish(system_port, capabilities, port_by_command_name, local_addr).await?;

        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.heartbeat_sink);
        let events_tx = self.events_tx.clone();
        let local_uuid = self.config.local_uuid;
        let protocol_identifier = self.config.protocol_identifier.clone();

        let browse_task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        handle_resolved(&state, &sink, &events_tx, local_uuid, &protocol_identifier, info).await;
                    }
                    ServiceEvent::ServiceRemoved(_ty_domain, fullname) => {
                        handle_removed(&state, &fullname).await;
                    }
                    ServiceEvent::SearchStarted(_) | ServiceEvent::SearchStopped(_) | ServiceEvent::ServiceFound(_, _) => {}
                    other => debug!(?other, "discovery: unhandled mdns event"),
                }
            }
        });

        let sweep_state = Arc::clone(&self.state);
        let sweep_events = self.events_tx.clone();
        let grace = self.config.heartbeat_grace;
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1).min(grace));
            loop {
                interval.tick().await;
                sweep_expired(&sweep_state, &sweep_events, grace).await;
            }
        });

        let hb_state = Arc::clone(&self.state);
        let hb_sink = Arc::clone(&self.heartbeat_sink);
        let hb_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(hb_interval);
            loop {
                interval.tick().await;
                resend_heartbeats(&hb_state, &hb_sink).await;
            }
        });

        *self.browse_task.lock().await = Some(browse_task);
        *self.sweep_task.lock().await = Some(sweep_task);
        *self.heartbeat_task.lock().await = Some(heartbeat_task);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.browse_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.sweep_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }
        if let Some(mdns) = self.mdns.lock().await.take() {
            if let Some(fullname) = self.fullname.lock().await.take() {
                if let Ok(receiver) = mdns.unregister(&fullname) {
                    let _ = receiver.recv_async().await;
                }
            }
            let _ = mdns.stop_browse(&self.config.service_type);
            let _ = mdns.shutdown();
        }
        let mut state = self.state.lock().await;
        state.pending.clear();
        state.visible.clear();
        state.fullname_to_uuid.clear();
    }

    async fn publish(
        &self,
        system_port: u16,
        capabilities: &HashSet<String>,
        port_by_command_name: &HashMap<String, u16>,
        local_addr: IpAddr,
    ) -> Result<()> {
        let txt = Peer::encode_txt(
            self.config.local_uuid,
            &self.config.protocol_identifier,
            system_port,
            capabilities,
            port_by_command_name,
        );
        let host_name = format!("{}.local.", self.config.instance_name);

        let service_info = ServiceInfo::new(
            &self.config.service_type,
            &self.config.instance_name,
            &host_name,
            local_addr,
            system_port,
            txt,
        )
        .map_err(|e| Error::ChannelBindFailed(e.to_string()))?;

        let registered_fullname = service_info.get_fullname().to_string();

        let guard = self.mdns.lock().await;
        let mdns = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("discovery published before start()".into()))?;

        // Re-publishing (capability change) replaces the previous
        // instance: mdns-sd has no in-place TXT update, so unregister the
        // prior advertisement (if any) before registering the new one.
        if let Some(previous) = self.fullname.lock().await.take() {
            if let Ok(receiver) = mdns.unregister(&previous) {
                let _ = receiver.recv_async().await;
            }
        }

        mdns.register(service_info).map_err(|e| Error::ChannelBindFailed(e.to_string()))?;
        drop(guard);
        *self.fullname.lock().await = Some(registered_fullname);
        info!(port = system_port, "discovery: published local service");
        Ok(())
    }

    /// Re-publish TXT after the local capability set (or per-command port
    /// map) changes (§4.5: publish/unpublish republishes the mDNS `cap` list).
    pub async fn republish_capabilities(
        &self,
        system_port: u16,
        capabilities: &HashSet<String>,
        port_by_command_name: &HashMap<String, u16>,
        local_addr: IpAddr,
    ) -> Result<()> {
        self.publish(system_port, capabilities, port_by_command_name, local_addr).await
    }

    pub async fn visible_peer(&self, uuid: Uuid) -> Option<Peer> {
        let state = self.state.lock().await;
        state.visible.get(&uuid).map(|t| t.peer.clone())
    }

    pub async fn visible_peers(&self) -> Vec<Peer> {
        let state = self.state.lock().await;
        state.visible.values().map(|t| t.peer.clone()).collect()
    }
}

async fn handle_resolved(
    state: &Arc<Mutex<DiscoveryState>>,
    sink: &Arc<dyn HeartbeatSink>,
    events_tx: &mpsc::UnboundedSender<PeerEvent>,
    local_uuid: Uuid,
    protocol_identifier: &str,
    info: ServiceInfo,
) {
    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    let Some(uuid) = Peer::uuid_from_txt(&txt) else {
        warn!("discovery: resolved service missing a parseable uuid TXT entry, dropping");
        return;
    };

    if uuid == local_uuid {
        return; // never report our own advertisement (§8 scenario 5).
    }

    if let Some(pid) = txt.get(txt_keys::PROTOCOL_ID) {
        if pid != protocol_identifier {
            debug!(%uuid, peer_pid = %pid, "discovery: protocol identifier mismatch, dropping");
            return;
        }
    }

    let addresses: Vec<std::net::SocketAddr> = info
        .get_addresses()
        .iter()
        .map(|ip| std::net::SocketAddr::new(*ip, info.get_port()))
        .collect();

    let fullname = info.get_fullname().to_string();

    let mut guard = state.lock().await;
    guard.fullname_to_uuid.insert(fullname, uuid);

    if let Some(tracked) = guard.visible.get_mut(&uuid) {
        let previous_capabilities = tracked.peer.capabilities.clone();
        tracked.peer.addresses = addresses;
        tracked.peer.update_from_txt(&txt);
        tracked.withdrawn_since = None;
        let peer = tracked.peer.clone();
        drop(guard);
        let _ = events_tx.send(PeerEvent::Updated { peer, previous_capabilities });
        return;
    }

    // Not yet visible: update (or create) the tentative record and kick
    // off a heartbeat handshake before reporting anything (§4.4 step 4-5).
    let peer = guard.pending.entry(uuid).or_insert_with(|| Peer::new(uuid, protocol_identifier.to_string()));
    peer.addresses = addresses;
    peer.update_from_txt(&txt);
    let candidate = peer.clone();
    drop(guard);

    let state = Arc::clone(state);
    let sink = Arc::clone(sink);
    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        attempt_handshake(state, sink, events_tx, candidate).await;
    });
}

async fn attempt_handshake(
    state: Arc<Mutex<DiscoveryState>>,
    sink: Arc<dyn HeartbeatSink>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer: Peer,
) {
    match sink.send_heartbeat(&peer).await {
        Ok(()) => {
            let now = Instant::now();
            let mut guard = state.lock().await;
            guard.pending.remove(&peer.uuid);
            guard.visible.insert(
                peer.uuid,
                TrackedPeer {
                    peer: peer.clone(),
                    last_heartbeat_at: now,
                    withdrawn_since: None,
                },
            );
            drop(guard);
            info!(peer = %peer.uuid, "discovery: heartbeat handshake succeeded, peer now visible");
            let _ = events_tx.send(PeerEvent::Added(peer));
        }
        Err(e) => {
            warn!(peer = %peer.uuid, error = %e, "discovery: heartbeat handshake failed");
            let mut guard = state.lock().await;
            guard.pending.remove(&peer.uuid);
        }
    }
}

async fn handle_removed(state: &Arc<Mutex<DiscoveryState>>, fullname: &str) {
    let mut guard = state.lock().await;
    let Some(uuid) = guard.fullname_to_uuid.get(fullname).copied() else {
        return;
    };
    guard.pending.remove(&uuid);
    if let Some(tracked) = guard.visible.get_mut(&uuid) {
        if tracked.withdrawn_since.is_none() {
            debug!(peer = %uuid, "discovery: mdns withdrawal, starting grace countdown");
            tracked.withdrawn_since = Some(Instant::now());
        }
    }
}

async fn sweep_expired(state: &Arc<Mutex<DiscoveryState>>, events_tx: &mpsc::UnboundedSender<PeerEvent>, grace: Duration) {
    let mut guard = state.lock().await;
    let now = Instant::now();
    let expired: Vec<Uuid> = guard
        .visible
        .iter()
        .filter(|(_, tracked)| {
            let withdrawal_expired = tracked.withdrawn_since.map(|since| now.duration_since(since) >= grace).unwrap_or(false);
            let heartbeat_stale = now.duration_since(tracked.last_heartbeat_at) >= grace;
            withdrawal_expired || heartbeat_stale
        })
        .map(|(uuid, _)| *uuid)
        .collect();

    for uuid in &expired {
        guard.visible.remove(uuid);
        guard.fullname_to_uuid.retain(|_, v| v != uuid);
    }
    drop(guard);

    for uuid in expired {
        info!(peer = %uuid, "discovery: peer removed after grace/heartbeat timeout");
        let _ = events_tx.send(PeerEvent::Removed(uuid));
    }
}

async fn resend_heartbeats(state: &Arc<Mutex<DiscoveryState>>, sink: &Arc<dyn HeartbeatSink>) {
    let peers: Vec<Peer> = {
        let guard = state.lock().await;
        guard.visible.values().map(|t| t.peer.clone()).collect()
    };

    for peer in peers {
        let state = Arc::clone(state);
        let sink = Arc::clone(sink);
        tokio::spawn(async move {
            if sink.send_heartbeat(&peer).await.is_ok() {
                let mut guard = state.lock().await;
                if let Some(tracked) = guard.visible.get_mut(&peer.uuid) {
                    tracked.last_heartbeat_at = Instant::now();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysOkSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HeartbeatSink for AlwaysOkSink {
        async fn send_heartbeat(&self, _peer: &Peer) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct AlwaysFailSink;

    #[async_trait]
    impl HeartbeatSink for AlwaysFailSink {
        async fn send_heartbeat(&self, _peer: &Peer) -> Result<()> {
            Err(Error::ConnectionClosed)
        }
    }

    #[tokio::test]
    async fn handshake_success_marks_peer_visible_and_emits_added() {
        let state = Arc::new(Mutex::new(DiscoveryState {
            pending: HashMap::new(),
            visible: HashMap::new(),
            fullname_to_uuid: HashMap::new(),
        }));
        let sink: Arc<dyn HeartbeatSink> = Arc::new(AlwaysOkSink { calls: AtomicUsize::new(0) });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Peer::new(Uuid::new_v4(), "meshrpc,1");

        attempt_handshake(Arc::clone(&state), sink, tx, peer.clone()).await;

        let guard = state.lock().await;
        assert!(guard.visible.contains_key(&peer.uuid));
        assert!(!guard.pending.contains_key(&peer.uuid));
        drop(guard);

        match rx.recv().await.unwrap() {
            PeerEvent::Added(p) => assert_eq!(p.uuid, peer.uuid),
            other => panic!("expected Added, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_failure_drops_pending_without_event() {
        let state = Arc::new(Mutex::new(DiscoveryState {
            pending: HashMap::new(),
            visible: HashMap::new(),
            fullname_to_uuid: HashMap::new(),
        }));
        let sink: Arc<dyn HeartbeatSink> = Arc::new(AlwaysFailSink);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Peer::new(Uuid::new_v4(), "meshrpc,1");

        attempt_handshake(Arc::clone(&state), sink, tx, peer.clone()).await;

        let guard = state.lock().await;
        assert!(!guard.visible.contains_key(&peer.uuid));
        drop(guard);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_removes_peer_past_withdrawal_grace() {
        let peer = Peer::new(Uuid::new_v4(), "meshrpc,1");
        let mut visible = HashMap::new();
        visible.insert(
            peer.uuid,
            TrackedPeer {
                peer: peer.clone(),
                last_heartbeat_at: Instant::now(),
                withdrawn_since: Some(Instant::now() - Duration::from_secs(200)),
            },
        );
        let state = Arc::new(Mutex::new(DiscoveryState {
            pending: HashMap::new(),
            visible,
            fullname_to_uuid: HashMap::new(),
        }));
        let (tx, mut rx) = mpsc::unbounded_channel();

        sweep_expired(&state, &tx, Duration::from_secs(120)).await;

        let guard = state.lock().await;
        assert!(!guard.visible.contains_key(&peer.uuid));
        drop(guard);
        match rx.recv().await.unwrap() {
            PeerEvent::Removed(uuid) => assert_eq!(uuid, peer.uuid),
            other => panic!("expected Removed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_keeps_peer_within_grace() {
        let peer = Peer::new(Uuid::new_v4(), "meshrpc,1");
        let mut visible = HashMap::new();
        visible.insert(
            peer.uuid,
            TrackedPeer {
                peer: peer.clone(),
                last_heartbeat_at: Instant::now(),
                withdrawn_since: Some(Instant::now() - Duration::from_secs(5)),
            },
        );
        let state = Arc::new(Mutex::new(DiscoveryState {
            pending: HashMap::new(),
            visible,
            fullname_to_uuid: HashMap::new(),
        }));
        let (tx, mut rx) = mpsc::unbounded_channel();

        sweep_expired(&state, &tx, Duration::from_secs(120)).await;

        let guard = state.lock().await;
        assert!(guard.visible.contains_key(&peer.uuid));
        drop(guard);
        assert!(rx.try_recv().is_err());
    }
}
