//! Dispatcher / Facade (§4.7): the single public surface a host application
//! builds against. Owns the registry, the reliable system channel, any
//! per-command channels created on demand, the discovery layer, and the
//! subscription manager, and orchestrates all of it behind `publish`,
//! `subscribe`, `send`, and friends.
//!
//! ## Breaking the reference cycle
//!
//! §9's design notes call out a `Channel ↔ Dispatcher ↔ Command ↔ Channel`
//! cycle in the source. This crate resolves it the way the notes suggest:
//! the dispatcher is the sole owner (`Arc<Dispatcher>`), and everything it
//! hands to a channel or to discovery is a non-owning [`Weak`] reference
//! wrapped in a small handle (`DispatcherHandle`) that upgrades on each
//! call and treats a dead dispatcher as "already shut down" rather than a
//! panic.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use meshrpc_core::command::{ChannelClass, CommandDescriptor, CommandPattern};
use meshrpc_core::config::ConfigurationDelegate;
use meshrpc_core::constants::{
    ANNOUNCE_COMMAND_PREFIX, CAPABILITY_COMMAND, DISCONNECT_COMMAND, HEARTBEAT_COMMAND, NOTIFICATION_ID,
    SUBSCRIBE_COMMAND, UNSUBSCRIBE_COMMAND,
};
use meshrpc_core::error::{Error, Result};
use meshrpc_core::peer::Peer;
use meshrpc_discovery::{Discovery, DiscoveryConfig, HeartbeatSink, PeerEvent};
use meshrpc_net::{Channel, ChannelDelegate, HeaderWidth, MulticastChannel, ReliableChannel, UnreliableChannel};

use crate::delegate::{ConnectorDelegate, DiscoveringPeerChange, DiscoveringPeersDelegate, NullConnectorDelegate};
use crate::executor::CallbackExecutor;
use crate::registry::{CommandBehavior, CommandRegistry, RegisteredCommand, RequestHandler};
use crate::subscription::{IncomingSubscriber, OutgoingSubscription, ReceiveHandler, SubscriptionManager};
use crate::system::{
    decode_command_list, decode_heartbeat, decode_subscribe, encode_capability_response, encode_command_list,
    encode_heartbeat, encode_subscribe,
};

/// Retained registration for a `start_discovery` call (§4.7 "Discovery
/// filtering"). Tracks which visible peers have already been reported
/// `Found` to this delegate so a later `Removed` mDNS event, which carries
/// only a UUID, can be turned into a `Removed` transition for exactly the
/// delegates that care.
struct DiscoveryFilter {
    required_capabilities: HashSet<String>,
    delegate: Arc<dyn DiscoveringPeersDelegate>,
    found: Mutex<HashSet<Uuid>>,
}

/// The channel a given command's traffic is carried on, as resolved by
/// [`Dispatcher::channel_for`]. System commands and ordinary (non-real-time)
/// reliable R+R commands share the system channel; anything else — P+S
/// commands, `isRealTime` R+R commands, unreliable, multicast — gets its own
/// channel instance keyed by command name.
enum ChannelKey {
    System,
    PerCommand(String),
}

/// A non-owning handle handed to channels and to the discovery layer so
/// neither holds a strong reference back to the dispatcher that owns them.
struct DispatcherHandle {
    dispatcher: Weak<Dispatcher>,
    channel_key: ChannelKey,
}

#[async_trait]
impl ChannelDelegate for DispatcherHandle {
    async fn handle_request(&self, source_addr: SocketAddr, method: String, params: Vec<Value>, id: u32) -> Option<Result<Value>> {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return None;
        };
        dispatcher.dispatch_inbound(&self.channel_key, source_addr, method, params, id).await
    }

    async fn handle_response(&self, _channel: &str, _from: Uuid, _id: u32, _result: Result<Value>) {
        // Each concrete channel completes its own pending-callback table
        // directly (see `meshrpc-net`'s reliable/unreliable/multicast
        // readers); this hook exists for delegate-interface symmetry and
        // for alternate channel implementations that don't own a pending
        // table themselves.
    }

    async fn handle_channel_error(&self, channel: &str, error: Error) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        dispatcher.notify_channel_error(channel.to_string(), error).await;
    }
}

#[async_trait]
impl HeartbeatSink for DispatcherHandle {
    async fn send_heartbeat(&self, peer: &Peer) -> Result<()> {
        let dispatcher = self.dispatcher.upgrade().ok_or_else(|| Error::Internal("dispatcher dropped".into()))?;
        dispatcher.send_heartbeat_to(peer).await
    }
}

/// Last-known configuration per published P+S command, used to decide
/// whether an incoming `_sub` should restart the publisher (§4.6 step 3).
type ConfigurationTable = Mutex<HashMap<String, Option<Value>>>;

/// The central facade (§4.7). Construct with [`Dispatcher::new`], call
/// [`Dispatcher::start`] to bind the system channel and begin discovery,
/// then `publish`/`subscribe`/`send` as needed.
pub struct Dispatcher {
    local_uuid: Uuid,
    config: Arc<dyn ConfigurationDelegate>,
    local_addr: IpAddr,
    registry: Arc<CommandRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    system_channel: Arc<ReliableChannel>,
    command_channels: Mutex<HashMap<String, Arc<dyn Channel>>>,
    discovery: Arc<Discovery>,
    executor: Arc<CallbackExecutor>,
    connector: Mutex<Arc<dyn ConnectorDelegate>>,
    discovery_filters: Mutex<Vec<DiscoveryFilter>>,
    announce_handlers: Mutex<HashMap<String, RequestHandler>>,
    last_configuration: ConfigurationTable,
    /// Taken by `start()`/`enter_foreground()` to spawn the peer-event drain
    /// task. Held here (rather than threaded out of the `new_cyclic`
    /// closure some other way) because construction only ever hands that
    /// closure a `Weak<Dispatcher>`, not a usable `Arc`.
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    events_task: Mutex<Option<JoinHandle<()>>>,
    port_by_command_name: Mutex<HashMap<String, u16>>,
}

impl Dispatcher {
    /// Build a new dispatcher. Resolves the host's primary LAN address via
    /// `local-ip-address` (the crate the teacher workspace already uses for
    /// this) up front since discovery needs it to publish TXT; a host with
    /// no routable interface gets `CHANNEL_BIND_FAILED` from `start()`
    /// instead of failing construction.
    pub fn new(config: Arc<dyn ConfigurationDelegate>, connector: Arc<dyn ConnectorDelegate>) -> Arc<Self> {
        let local_uuid = Uuid::new_v4();
        let local_addr = local_ip_address::local_ip().unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

        Arc::new_cyclic(|weak: &Weak<Dispatcher>| {
            let system_delegate: Arc<dyn ChannelDelegate> = Arc::new(DispatcherHandle {
                dispatcher: weak.clone(),
                channel_key: ChannelKey::System,
            });
            let system_channel = Arc::new(ReliableChannel::new(
                HEARTBEAT_COMMAND,
                system_delegate,
                config.framing_cap(),
                HeaderWidth::RequestResponse,
            ));

            let heartbeat_sink: Arc<dyn HeartbeatSink> = Arc::new(DispatcherHandle {
                dispatcher: weak.clone(),
                channel_key: ChannelKey::System,
            });
            let discovery_config = DiscoveryConfig {
                local_uuid,
                protocol_identifier: config.protocol_identifier(),
                instance_name: config.instance_name(),
                service_type: config.service_type(),
                service_domain: config.service_domain(),
                heartbeat_grace: config.heartbeat_grace(),
                heartbeat_interval: config.heartbeat_interval(),
            };
            let (discovery, events_rx) = Discovery::new(discovery_config, heartbeat_sink);

            let dispatcher = Self {
                local_uuid,
                config,
                local_addr,
                registry: Arc::new(CommandRegistry::new()),
                subscriptions: Arc::new(SubscriptionManager::new()),
                system_channel,
                command_channels: Mutex::new(HashMap::new()),
                discovery: Arc::new(discovery),
                executor: Arc::new(CallbackExecutor::new()),
                connector: Mutex::new(connector),
                discovery_filters: Mutex::new(Vec::new()),
                announce_handlers: Mutex::new(HashMap::new()),
                last_configuration: Mutex::new(HashMap::new()),
                events_rx: Mutex::new(Some(events_rx)),
                events_task: Mutex::new(None),
                port_by_command_name: Mutex::new(HashMap::new()),
            };

            dispatcher
        })
    }

    /// A convenience constructor for the common case of a stock
    /// [`meshrpc_core::config::DefaultConfiguration`] and a
    /// [`NullConnectorDelegate`], overridden per-event via the setters.
    pub fn with_defaults(protocol_identifier: impl Into<String>, instance_name: impl Into<String>) -> Arc<Self> {
        let config = Arc::new(meshrpc_core::config::DefaultConfiguration::new(protocol_identifier, instance_name));
        Self::new(config, Arc::new(NullConnectorDelegate))
    }

    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    /// Bind the system channel (port 0 = OS-assigned unless overridden) and
    /// start mDNS publication/browsing and the discovery background tasks.
    pub async fn start(self: &Arc<Self>, system_port: u16) -> Result<()> {
        self.system_channel.start(system_port).await?;
        let bound_port = self.system_channel.bound_port().ok_or_else(|| Error::Internal("system channel did not report a bound port".into()))?;
        self.port_by_command_name.lock().await.insert(HEARTBEAT_COMMAND.to_string(), bound_port);

        let capabilities = self.registry.capability_names().await;
        let ports = self.port_by_command_name.lock().await.clone();
        self.discovery.start(bound_port, &capabilities, &ports, self.local_addr).await?;

        let events_rx = self.events_rx.lock().await.take();
        if let Some(mut events_rx) = events_rx {
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    let Some(dispatcher) = weak.upgrade() else { break };
                    dispatcher.handle_peer_event(event).await;
                }
            });
            *self.events_task.lock().await = Some(task);
        }

        info!(port = bound_port, uuid = %self.local_uuid, "dispatcher started");
        Ok(())
    }

    /// Stop discovery, tear down every channel, and drain the callback
    /// queue. Mirrors `enter_background` but permanent (no matching
    /// `resume`); used for final shutdown.
    pub async fn stop(self: &Arc<Self>) {
        self.enter_background().await;
        if let Some(task) = self.events_task.lock().await.take() {
            task.abort();
        }
    }

    // ---- publish / unpublish (§4.5) ----------------------------------

    pub async fn publish(self: &Arc<Self>, descriptor: CommandDescriptor, behavior: CommandBehavior) -> Result<()> {
        let name = descriptor.name.clone();
        let channel_class = descriptor.channel_class;
        let is_real_time = match &descriptor.pattern {
            CommandPattern::PublishSubscribe(opts) => opts.is_real_time,
            CommandPattern::RequestResponse => false,
        };
        let is_ps = descriptor.pattern.is_publish_subscribe();

        self.registry.publish(RegisteredCommand { descriptor, behavior }).await?;

        let key = Self::channel_key_for(&name, channel_class, is_real_time, is_ps);
        if let ChannelKey::PerCommand(_) = &key {
            if let Err(e) = self.ensure_channel(&key, channel_class, is_real_time).await {
                // Roll back the registry entry so publish is all-or-nothing.
                let _ = self.registry.unpublish(&name).await;
                return Err(e);
            }
        }

        self.republish_capabilities().await?;
        Ok(())
    }

    pub async fn publish_many(self: &Arc<Self>, commands: Vec<(CommandDescriptor, CommandBehavior)>) -> Result<()> {
        for (descriptor, behavior) in commands {
            self.publish(descriptor, behavior).await?;
        }
        Ok(())
    }

    pub async fn unpublish(self: &Arc<Self>, name: &str) -> Result<()> {
        let registered = self.registry.unpublish(name).await?;

        // Force-disconnect every current subscriber (§4.5).
        let subscribers = self.subscriptions.subscribers_for_command(name).await;
        for peer_uuid in &subscribers {
            if let Some(peer) = self.discovery.visible_peer(*peer_uuid).await {
                let _ = self.send_system(&peer, DISCONNECT_COMMAND, encode_command_list(vec![name.to_string()])?).await;
            }
        }
        self.subscriptions.remove_all_incoming_for_command(name).await;

        if registered.behavior.is_publish_subscribe() {
            if let CommandBehavior::PublishSubscribe { publisher, .. } = &registered.behavior {
                publisher.stop().await;
            }
        }

        let mut channels = self.command_channels.lock().await;
        if let Some(channel) = channels.remove(name) {
            channel.stop().await;
        }
        drop(channels);
        self.port_by_command_name.lock().await.remove(name);

        self.republish_capabilities().await?;
        Ok(())
    }

    fn channel_key_for(name: &str, channel_class: ChannelClass, is_real_time: bool, is_publish_subscribe: bool) -> ChannelKey {
        match channel_class {
            ChannelClass::Reliable if !is_real_time && !is_publish_subscribe => ChannelKey::System,
            _ => ChannelKey::PerCommand(name.to_string()),
        }
    }

    async fn ensure_channel(self: &Arc<Self>, key: &ChannelKey, channel_class: ChannelClass, is_real_time: bool) -> Result<()> {
        let ChannelKey::PerCommand(name) = key else { return Ok(()) };

        let mut channels = self.command_channels.lock().await;
        if channels.contains_key(name) {
            return Ok(());
        }

        let delegate: Arc<dyn ChannelDelegate> = Arc::new(DispatcherHandle {
            dispatcher: Arc::downgrade(self),
            channel_key: ChannelKey::PerCommand(name.clone()),
        });

        let channel: Arc<dyn Channel> = match channel_class {
            ChannelClass::Reliable => {
                let reliable = Arc::new(ReliableChannel::new(name.clone(), delegate, self.config.framing_cap(), HeaderWidth::PublishSubscribe));
                reliable.set_real_time(is_real_time);
                reliable
            }
            ChannelClass::Unreliable => Arc::new(UnreliableChannel::new(name.clone(), delegate)),
            ChannelClass::Multicast => Arc::new(MulticastChannel::new(
                name.clone(),
                self.local_uuid,
                self.config.multicast_group(),
                self.config.multicast_port(),
                self.config.multicast_dedup_window(),
                delegate,
            )),
        };

        let requested_port = if matches!(channel_class, ChannelClass::Multicast) { self.config.multicast_port() } else { 0 };
        channel.start(requested_port).await?;
        let bound_port = channel.bound_port().unwrap_or(requested_port);
        channels.insert(name.clone(), channel);
        drop(channels);

        self.port_by_command_name.lock().await.insert(name.clone(), bound_port);
        Ok(())
    }

    async fn channel_for(&self, key: &ChannelKey) -> Option<Arc<dyn Channel>> {
        match key {
            ChannelKey::System => Some(self.system_channel.clone() as Arc<dyn Channel>),
            ChannelKey::PerCommand(name) => self.command_channels.lock().await.get(name).cloned(),
        }
    }

    async fn republish_capabilities(&self) -> Result<()> {
        let capabilities = self.registry.capability_names().await;
        let ports = self.port_by_command_name.lock().await.clone();
        let system_port = self.system_channel.bound_port().unwrap_or(0);
        if system_port == 0 {
            // Not started yet; `start()` will publish with the final set.
            return Ok(());
        }
        self.discovery.republish_capabilities(system_port, &capabilities, &ports, self.local_addr).await
    }

    // ---- discovery filtering (§4.7) -----------------------------------

    pub async fn start_discovery(self: &Arc<Self>, required_capabilities: HashSet<String>, delegate: Arc<dyn DiscoveringPeersDelegate>) {
        let found = Mutex::new(HashSet::new());
        {
            let mut found_guard = found.lock().await;
            for peer in self.discovery.visible_peers().await {
                if peer.satisfies(&required_capabilities) {
                    found_guard.insert(peer.uuid);
                    let delegate = Arc::clone(&delegate);
                    self.submit_delegate_event(async move {
                        delegate.did_change_discovering_peer(DiscoveringPeerChange::Found(peer)).await;
                    })
                    .await;
                }
            }
        }
        self.discovery_filters.lock().await.push(DiscoveryFilter { required_capabilities, delegate, found });
    }

    pub async fn stop_discovery(&self, required_capabilities: &HashSet<String>, delegate: &Arc<dyn DiscoveringPeersDelegate>) {
        let mut filters = self.discovery_filters.lock().await;
        filters.retain(|f| !(f.required_capabilities == *required_capabilities && Arc::ptr_eq(&f.delegate, delegate)));
    }

    // ---- subscribe / unsubscribe / disconnect (§4.6) ------------------

    pub async fn subscribe(self: &Arc<Self>, command_name: &str, configuration: Option<Value>, peer_uuid: Uuid, receive: ReceiveHandler) -> Result<()> {
        let peer = self.discovery.visible_peer(peer_uuid).await.ok_or_else(|| Error::PeerUnknown(peer_uuid.to_string()))?;
        if !peer.has_capability(command_name) {
            return Err(Error::PeerIncapable { peer: peer_uuid.to_string(), command: command_name.to_string() });
        }

        let descriptor = self.command_descriptor_hint(command_name, &peer).await;
        let channel_class = descriptor.unwrap_or(ChannelClass::Reliable);
        let key = ChannelKey::PerCommand(command_name.to_string());
        let port = if matches!(channel_class, ChannelClass::Unreliable) {
            self.ensure_channel(&key, channel_class, false).await?;
            self.channel_for(&key).await.and_then(|c| c.bound_port())
        } else {
            None
        };

        let params = encode_subscribe(command_name, configuration.clone(), port)?;
        let response = self.send_system(&peer, SUBSCRIBE_COMMAND, params).await;
        match response {
            Ok(_) => {
                self.subscriptions
                    .insert_outgoing(peer_uuid, command_name.to_string(), OutgoingSubscription { configuration, receive_handler: receive })
                    .await;
                self.notify_add_subscription(command_name.to_string(), peer).await;
                Ok(())
            }
            Err(e) => Err(Error::SubscribeFailed(e.to_string())),
        }
    }

    /// `None` unsubscribes from every command currently subscribed at `peer`
    /// (§4.7 `unsubscribe(commandClass|*, peer, completion)`).
    pub async fn unsubscribe(self: &Arc<Self>, command_name: Option<&str>, peer_uuid: Uuid) -> Result<()> {
        let commands: Vec<String> = match command_name {
            Some(name) => vec![name.to_string()],
            None => self.subscriptions.outgoing_commands_for_peer(peer_uuid).await,
        };
        if commands.is_empty() {
            return Ok(());
        }

        if let Some(peer) = self.discovery.visible_peer(peer_uuid).await {
            let params = encode_command_list(commands.clone())?;
            self.send_system(&peer, UNSUBSCRIBE_COMMAND, params)
                .await
                .map_err(|e| Error::UnsubscribeFailed(e.to_string()))?;
        }

        for name in commands {
            self.subscriptions.remove_outgoing(peer_uuid, &name).await;
            self.notify_remove_subscription(name, peer_uuid).await;
        }
        Ok(())
    }

    pub async fn unsubscribe_all(self: &Arc<Self>, peer_uuid: Uuid) -> Result<()> {
        self.unsubscribe(None, peer_uuid).await
    }

    /// Publisher-initiated teardown (§4.6): notifies the subscriber via
    /// `_disc` so it drops its local subscription without further traffic,
    /// then mirrors the cleanup on this (publisher) side.
    pub async fn disconnect(self: &Arc<Self>, command_name: Option<&str>, peer_uuid: Uuid) -> Result<()> {
        let commands: Vec<String> = match command_name {
            Some(name) => vec![name.to_string()],
            None => {
                let mut names = HashSet::new();
                for name in self.subscriptions.remove_all_incoming_for_peer(peer_uuid).await {
                    names.insert(name.0);
                }
                names.into_iter().collect()
            }
        };
        if commands.is_empty() {
            return Ok(());
        }

        if let Some(peer) = self.discovery.visible_peer(peer_uuid).await {
            let params = encode_command_list(commands.clone())?;
            let _ = self.send_system(&peer, DISCONNECT_COMMAND, params).await;
        }

        for name in commands {
            let (_removed, now_empty) = self.subscriptions.remove_incoming(&name, peer_uuid).await;
            if now_empty {
                if let Some((publisher, _)) = self.registry.publisher(&name).await {
                    publisher.stop().await;
                }
            }
            self.notify_remove_subscriber(name, peer_uuid).await;
        }
        Ok(())
    }

    pub async fn disconnect_all(self: &Arc<Self>, peer_uuid: Uuid) -> Result<()> {
        self.disconnect(None, peer_uuid).await
    }

    /// Best-effort hint at a peer-advertised command's channel class, used
    /// by `subscribe` to decide whether it needs to open a local UDP port
    /// before sending `_sub`. Falls back to `Reliable` (the common case)
    /// when this side has never published the same command name itself —
    /// the subscriber doesn't need to know the publisher's exact channel
    /// class beyond reliable vs. unreliable, since the publisher advertises
    /// its own port either way.
    async fn command_descriptor_hint(&self, command_name: &str, _peer: &Peer) -> Option<ChannelClass> {
        self.registry.descriptor(command_name).await.map(|d| d.channel_class)
    }

    // ---- send / push (§4.7 `send`) ------------------------------------

    /// Request/response send: allocates a fresh id on the resolved channel,
    /// registers a pending-callback entry, and awaits it with the
    /// configured response timeout (§5 "Cancellation / timeouts").
    pub async fn send(self: &Arc<Self>, command_name: &str, params: Vec<Value>, peer_uuid: Uuid) -> Result<Value> {
        let peer = self.discovery.visible_peer(peer_uuid).await.ok_or_else(|| Error::PeerUnknown(peer_uuid.to_string()))?;
        if !peer.has_capability(command_name) && !self.is_system_command(command_name) {
            return Err(Error::PeerIncapable { peer: peer_uuid.to_string(), command: command_name.to_string() });
        }
        self.send_system(&peer, command_name, params).await
    }

    /// P+S push (`id == 0`, no response expected). Routed over whichever
    /// channel the command was published/subscribed on.
    pub async fn push(self: &Arc<Self>, command_name: &str, params: Vec<Value>, peer_uuid: Uuid) -> Result<()> {
        let peer = self.discovery.visible_peer(peer_uuid).await.ok_or_else(|| Error::PeerUnknown(peer_uuid.to_string()))?;
        let key = ChannelKey::PerCommand(command_name.to_string());
        let channel = self
            .channel_for(&key)
            .await
            .or_else(|| Some(self.system_channel.clone() as Arc<dyn Channel>))
            .ok_or_else(|| Error::UnknownCommand(command_name.to_string()))?;
        channel.send(&peer, command_name, NOTIFICATION_ID, params).await
    }

    fn is_system_command(&self, name: &str) -> bool {
        matches!(name, HEARTBEAT_COMMAND | SUBSCRIBE_COMMAND | UNSUBSCRIBE_COMMAND | DISCONNECT_COMMAND | CAPABILITY_COMMAND)
            || name.starts_with(ANNOUNCE_COMMAND_PREFIX)
    }

    /// Send a request over whichever channel the command is mapped to
    /// (system channel for system commands and ordinary reliable R+R user
    /// commands; a dedicated per-command channel otherwise) and await its
    /// response.
    async fn send_system(&self, peer: &Peer, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.system_channel.next_request_id();
        let rx = self.system_channel.pending().register(self.system_channel.id().to_string(), peer.uuid, id);
        self.system_channel.send(peer, method, id, params).await?;
        self.system_channel.await_response(peer.uuid, id, rx, self.config.response_timeout()).await
    }

    async fn send_heartbeat_to(&self, peer: &Peer) -> Result<()> {
        self.send_system(peer, HEARTBEAT_COMMAND, encode_heartbeat(self.local_uuid)?).await.map(|_| ())
    }

    // ---- announce (§4.8 `_ann`) ----------------------------------------

    /// Register an announce-style R+R command under a `_`-prefixed name,
    /// the one deliberate exception to "system names are reserved" (§4.8):
    /// the source models `_ann` as an abstract, subclass-defined command
    /// (`CADAnnounceCommand`); this is the registrable equivalent.
    pub async fn register_announce_command(&self, name: &str, handler: RequestHandler) -> Result<()> {
        if !name.starts_with(ANNOUNCE_COMMAND_PREFIX) {
            return Err(Error::Internal(format!("announce command '{name}' must use the '{ANNOUNCE_COMMAND_PREFIX}' prefix")));
        }
        self.announce_handlers.lock().await.insert(name.to_string(), handler);
        Ok(())
    }

    // ---- app lifecycle (§5 "App lifecycle") ----------------------------

    /// Stops discovery and tears down every subscription (incoming and
    /// outgoing) and every known peer, as if each had been individually
    /// disconnected.
    pub async fn enter_background(self: &Arc<Self>) {
        self.discovery.stop().await;
        for peer in self.discovery.visible_peers().await {
            self.teardown_peer(peer.uuid).await;
        }
        let mut channels = self.command_channels.lock().await;
        for (_, channel) in channels.drain() {
            channel.stop().await;
        }
        drop(channels);
        self.system_channel.stop().await;
    }

    pub async fn enter_foreground(self: &Arc<Self>) -> Result<()> {
        let system_port = self.system_channel.bound_port().unwrap_or(0);
        self.system_channel.start(system_port).await?;
        let capabilities = self.registry.capability_names().await;
        let ports = self.port_by_command_name.lock().await.clone();
        self.discovery.start(self.system_channel.bound_port().unwrap_or(system_port), &capabilities, &ports, self.local_addr).await
    }

    async fn teardown_peer(&self, peer_uuid: Uuid) {
        for (name, now_empty) in self.subscriptions.remove_all_incoming_for_peer(peer_uuid).await {
            if now_empty {
                if let Some((publisher, _)) = self.registry.publisher(&name).await {
                    publisher.stop().await;
                }
            }
        }
        self.subscriptions.remove_all_outgoing_for_peer(peer_uuid).await;
        self.system_channel.remove_peer(peer_uuid).await;
        let channels = self.command_channels.lock().await;
        for channel in channels.values() {
            channel.remove_peer(peer_uuid).await;
        }
    }

    // ---- inbound dispatch -----------------------------------------------

    /// Resolve the sending peer for an inbound request by its source
    /// address's IP alone (§4.2 `hasAddress`, §4.6 step 2: "resolve sender
    /// peer via source address").
    async fn resolve_peer_by_addr(&self, addr: SocketAddr) -> Option<Peer> {
        self.discovery.visible_peers().await.into_iter().find(|p| p.has_address(addr.ip()))
    }

    /// Routes the request and returns its result. The calling channel puts
    /// the response on the wire itself: for a reliable channel that means
    /// writing it straight back on the connection the request arrived on,
    /// without resolving a `Peer` at all, so a reply always reaches a
    /// sender regardless of whether we've recognized them as a peer yet
    /// (the `_hb` race: both sides heartbeat each other before either is
    /// visible to the other).
    async fn dispatch_inbound(&self, channel_key: &ChannelKey, source_addr: SocketAddr, method: String, params: Vec<Value>, id: u32) -> Option<Result<Value>> {
        let result = self.route(channel_key, source_addr, &method, params, id).await;
        Some(result)
    }

    async fn route(&self, channel_key: &ChannelKey, source_addr: SocketAddr, method: &str, params: Vec<Value>, id: u32) -> Result<Value> {
        match method {
            HEARTBEAT_COMMAND => self.handle_heartbeat(&params),
            SUBSCRIBE_COMMAND => self.handle_subscribe(source_addr, &params).await,
            UNSUBSCRIBE_COMMAND => self.handle_unsubscribe(source_addr, &params).await,
            DISCONNECT_COMMAND => self.handle_disconnect(source_addr, &params).await,
            CAPABILITY_COMMAND => self.handle_capability().await,
            _ if method.starts_with(ANNOUNCE_COMMAND_PREFIX) => self.handle_announce(source_addr, method, params).await,
            _ => self.handle_user_command(channel_key, source_addr, method, params, id).await,
        }
    }

    fn handle_heartbeat(&self, params: &[Value]) -> Result<Value> {
        let _ = decode_heartbeat(params)?;
        Ok(Value::Null)
    }

    async fn handle_subscribe(&self, source_addr: SocketAddr, params: &[Value]) -> Result<Value> {
        let args = decode_subscribe(params)?;
        let peer = self.resolve_peer_by_addr(source_addr).await.ok_or_else(|| Error::PeerUnknown(source_addr.to_string()))?;
        let (publisher, restart_on_update) = self.registry.publisher(&args.command_name).await.ok_or_else(|| Error::UnknownCommand(args.command_name.clone()))?;

        let mut last_config = self.last_configuration.lock().await;
        let previous = last_config.get(&args.command_name).cloned().flatten();
        let config_changed = previous != args.configuration;
        if config_changed && restart_on_update && self.subscriptions.subscriber_count(&args.command_name).await > 0 {
            publisher.stop().await;
            publisher.apply_configuration(args.configuration.clone()).await;
            publisher.start().await.map_err(|e| Error::SubscribeFailed(e.to_string()))?;
        }
        last_config.insert(args.command_name.clone(), args.configuration.clone());
        drop(last_config);

        let was_first = self
            .subscriptions
            .insert_incoming(args.command_name.clone(), peer.uuid, IncomingSubscriber { udp_port: args.port, configuration: args.configuration.clone() })
            .await;

        if was_first {
            if let Err(e) = publisher.start().await {
                self.subscriptions.remove_incoming(&args.command_name, peer.uuid).await;
                return Err(Error::SubscribeFailed(e.to_string()));
            }
        }

        self.notify_add_subscriber(args.command_name.clone(), peer).await;
        Ok(Value::Null)
    }

    async fn handle_unsubscribe(&self, source_addr: SocketAddr, params: &[Value]) -> Result<Value> {
        let args = decode_command_list(params)?;
        let peer_uuid = self.resolve_peer_by_addr(source_addr).await.map(|p| p.uuid).ok_or_else(|| Error::PeerUnknown(source_addr.to_string()))?;

        for name in args.commands {
            let (_removed, now_empty) = self.subscriptions.remove_incoming(&name, peer_uuid).await;
            if now_empty {
                if let Some((publisher, _)) = self.registry.publisher(&name).await {
                    publisher.stop().await;
                }
            }
            self.notify_remove_subscriber(name, peer_uuid).await;
        }
        Ok(Value::Null)
    }

    async fn handle_disconnect(&self, source_addr: SocketAddr, params: &[Value]) -> Result<Value> {
        let args = decode_command_list(params)?;
        let peer_uuid = self.resolve_peer_by_addr(source_addr).await.map(|p| p.uuid).ok_or_else(|| Error::PeerUnknown(source_addr.to_string()))?;

        for name in args.commands {
            self.subscriptions.remove_outgoing(peer_uuid, &name).await;
            self.notify_remove_subscription(name, peer_uuid).await;
        }
        Ok(Value::Null)
    }

    async fn handle_capability(&self) -> Result<Value> {
        let capabilities: Vec<String> = self.registry.capability_names().await.into_iter().collect();
        encode_capability_response(capabilities)
    }

    async fn handle_announce(&self, source_addr: SocketAddr, method: &str, params: Vec<Value>) -> Result<Value> {
        let peer = self.resolve_peer_by_addr(source_addr).await.ok_or_else(|| Error::PeerUnknown(source_addr.to_string()))?;
        let handler = self.announce_handlers.lock().await.get(method).cloned().ok_or_else(|| Error::UnknownCommand(method.to_string()))?;
        self.run_on_executor(handler(peer, params)).await
    }

    async fn handle_user_command(&self, channel_key: &ChannelKey, source_addr: SocketAddr, method: &str, params: Vec<Value>, id: u32) -> Result<Value> {
        let peer = self.resolve_peer_by_addr(source_addr).await.ok_or_else(|| Error::PeerUnknown(source_addr.to_string()))?;

        if id == NOTIFICATION_ID {
            if let Some(handler) = self.subscriptions.receive_handler(peer.uuid, method).await {
                let fut = handler(peer, params);
                self.executor.submit(fut).await;
            } else {
                debug!(%method, peer = %peer.uuid, "dispatcher: push for unknown subscription, dropping");
            }
            return Ok(Value::Null);
        }

        let _ = channel_key; // user R+R commands are always resolved by name via the registry, not the channel they arrived on.
        let handler = self.registry.request_handler(method).await.ok_or_else(|| Error::UnknownCommand(method.to_string()))?;
        self.run_on_executor(handler(peer, params)).await
    }

    /// Runs a receive-handler/response-producing future on the callback
    /// executor rather than inline on the I/O task (§4.7 "Callback
    /// executor"), then awaits its result here so the reply can still be
    /// written once the handler completes.
    async fn run_on_executor(&self, future: futures::future::BoxFuture<'static, Result<Value>>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.executor
            .submit(Box::pin(async move {
                let result = future.await;
                let _ = tx.send(result);
            }))
            .await;
        rx.await.map_err(|_| Error::Internal("callback executor dropped the result channel".into()))?
    }

    async fn notify_channel_error(&self, channel: String, error: Error) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.did_fail_with_error(channel, error).await }).await;
    }

    // Each of these clones the current connector delegate and submits a
    // self-contained `async move` block to the callback executor. The
    // block must own everything it touches (the connector, the peer data)
    // rather than borrow it, since the executor runs it on its own task
    // well after this method returns.

    async fn notify_add_peer(&self, peer: Peer) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.did_add_peer(peer).await }).await;
    }

    async fn notify_update_peer(&self, peer: Peer, previous_capabilities: HashSet<String>) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.did_update_peer(peer, previous_capabilities).await }).await;
    }

    async fn notify_will_remove_peer(&self, peer_uuid: Uuid) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.will_remove_peer(peer_uuid).await }).await;
    }

    async fn notify_add_subscriber(&self, command_name: String, peer: Peer) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.did_add_subscriber(command_name, peer).await }).await;
    }

    async fn notify_remove_subscriber(&self, command_name: String, peer_uuid: Uuid) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.did_remove_subscriber(command_name, peer_uuid).await }).await;
    }

    async fn notify_add_subscription(&self, command_name: String, peer: Peer) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.did_add_subscription(command_name, peer).await }).await;
    }

    async fn notify_remove_subscription(&self, command_name: String, peer_uuid: Uuid) {
        let connector = Arc::clone(&*self.connector.lock().await);
        self.submit_delegate_event(async move { connector.did_remove_subscription(command_name, peer_uuid).await }).await;
    }

    async fn submit_delegate_event<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.executor.submit(Box::pin(future)).await;
    }

    /// Discovery's peer-lifecycle stream (§4.4): drives `ConnectorDelegate`
    /// notifications, discovery-filter `Found`/`Update`/`Remove`
    /// transitions, and the subscription manager's capability-loss
    /// teardown (§4.6 "Heartbeat-driven consistency").
    async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Added(peer) => {
                self.update_discovery_filters(&peer, None).await;
                self.notify_add_peer(peer).await;
            }
            PeerEvent::Updated { peer, previous_capabilities } => {
                self.update_discovery_filters(&peer, Some(&previous_capabilities)).await;
                self.teardown_lost_subscriptions(&peer).await;
                let peer_for_notify = peer.clone();
                self.notify_update_peer(peer_for_notify, previous_capabilities).await;
            }
            PeerEvent::Removed(peer_uuid) => {
                self.teardown_peer(peer_uuid).await;
                for filter in self.discovery_filters.lock().await.iter() {
                    let mut found = filter.found.lock().await;
                    if found.remove(&peer_uuid) {
                        let delegate = Arc::clone(&filter.delegate);
                        self.submit_delegate_event(async move {
                            delegate.did_change_discovering_peer(DiscoveringPeerChange::Removed(peer_uuid)).await;
                        })
                        .await;
                    }
                }
                self.notify_will_remove_peer(peer_uuid).await;
            }
        }
    }

    async fn update_discovery_filters(&self, peer: &Peer, previous_capabilities: Option<&HashSet<String>>) {
        let filters = self.discovery_filters.lock().await;
        for filter in filters.iter() {
            let now_satisfies = peer.satisfies(&filter.required_capabilities);
            let mut found = filter.found.lock().await;
            let was_found = found.contains(&peer.uuid);

            if now_satisfies && !was_found {
                found.insert(peer.uuid);
                let delegate = Arc::clone(&filter.delegate);
                let peer = peer.clone();
                self.submit_delegate_event(async move {
                    delegate.did_change_discovering_peer(DiscoveringPeerChange::Found(peer)).await;
                })
                .await;
            } else if !now_satisfies && was_found {
                found.remove(&peer.uuid);
                let delegate = Arc::clone(&filter.delegate);
                let uuid = peer.uuid;
                self.submit_delegate_event(async move {
                    delegate.did_change_discovering_peer(DiscoveringPeerChange::Removed(uuid)).await;
                })
                .await;
            } else if now_satisfies && was_found && previous_capabilities.is_some() {
                let delegate = Arc::clone(&filter.delegate);
                let peer = peer.clone();
                self.submit_delegate_event(async move {
                    delegate.did_change_discovering_peer(DiscoveringPeerChange::Updated(peer)).await;
                })
                .await;
            }
        }
    }

    /// §4.6 "Heartbeat-driven consistency": if a peer update drops a
    /// command from its capabilities, tear down any outgoing subscription
    /// to that command locally — no network traffic, since the publisher
    /// has presumably disappeared.
    async fn teardown_lost_subscriptions(&self, peer: &Peer) {
        for command_name in self.subscriptions.outgoing_commands_for_peer(peer.uuid).await {
            if !peer.capabilities.contains(&command_name) {
                self.subscriptions.remove_outgoing(peer.uuid, &command_name).await;
                self.notify_remove_subscription(command_name, peer.uuid).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_core::command::PublishSubscribeOptions;
    use meshrpc_core::config::DefaultConfiguration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> Arc<dyn ConfigurationDelegate> {
        Arc::new(DefaultConfiguration::new("meshrpc-test,1", "dispatcher-test"))
    }

    #[tokio::test]
    async fn publish_then_unpublish_round_trips_capabilities() {
        let dispatcher = Dispatcher::new(test_config(), Arc::new(NullConnectorDelegate));
        dispatcher.start(0).await.unwrap();

        let descriptor = CommandDescriptor::request_response("echo", ChannelClass::Reliable).unwrap();
        let behavior = CommandBehavior::RequestResponse(Arc::new(|_peer, params| Box::pin(async move { Ok(Value::Array(params)) })));
        dispatcher.publish(descriptor, behavior).await.unwrap();
        assert!(dispatcher.registry.is_published("echo").await);

        dispatcher.unpublish("echo").await.unwrap();
        assert!(!dispatcher.registry.is_published("echo").await);
        dispatcher.stop().await;
    }

    struct CountingPublisher {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl crate::registry::Publisher for CountingPublisher {
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn last_subscriber_unsubscribe_stops_publisher_exactly_once() {
        let dispatcher = Dispatcher::new(test_config(), Arc::new(NullConnectorDelegate));
        dispatcher.start(0).await.unwrap();

        let publisher = Arc::new(CountingPublisher { starts: AtomicUsize::new(0), stops: AtomicUsize::new(0) });
        let descriptor = CommandDescriptor::publish_subscribe(
            "motion",
            ChannelClass::Reliable,
            PublishSubscribeOptions { is_real_time: false, restart_on_configuration_update: false },
        )
        .unwrap();
        dispatcher
            .publish(descriptor, CommandBehavior::PublishSubscribe { publisher: Arc::clone(&publisher) as Arc<dyn crate::registry::Publisher>, restart_on_configuration_update: false })
            .await
            .unwrap();

        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();
        let was_first_a = dispatcher.subscriptions.insert_incoming("motion".into(), peer_a, IncomingSubscriber { udp_port: None, configuration: None }).await;
        assert!(was_first_a);
        publisher.start().await.unwrap();
        let was_first_b = dispatcher.subscriptions.insert_incoming("motion".into(), peer_b, IncomingSubscriber { udp_port: None, configuration: None }).await;
        assert!(!was_first_b);

        let (_, now_empty_a) = dispatcher.subscriptions.remove_incoming("motion", peer_a).await;
        assert!(!now_empty_a);
        let (_, now_empty_b) = dispatcher.subscriptions.remove_incoming("motion", peer_b).await;
        assert!(now_empty_b);
        if now_empty_b {
            publisher.stop().await;
        }

        assert_eq!(publisher.starts.load(Ordering::Relaxed), 1);
        assert_eq!(publisher.stops.load(Ordering::Relaxed), 1);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn system_commands_cannot_be_published_by_user_code() {
        let err = CommandDescriptor::request_response("_hb", ChannelClass::Reliable).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn announce_command_requires_prefix() {
        let dispatcher = Dispatcher::new(test_config(), Arc::new(NullConnectorDelegate));
        let err = dispatcher.register_announce_command("ann", Arc::new(|_peer, _params| Box::pin(async { Ok(Value::Null) }))).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        dispatcher.register_announce_command("_ann", Arc::new(|_peer, _params| Box::pin(async { Ok(Value::Null) }))).await.unwrap();
    }
}
