//! Reliable (TCP) channel (§4.3).
//!
//! On first send to a peer a TCP connection is opened and cached by peer
//! UUID. R+R requests allocate a fresh monotonic id and register a
//! pending-callback entry; responses are matched back to that entry. A
//! socket that disconnects fails all of its pending callbacks with
//! `CONNECTION_CLOSED` (not `didFailWithError` — see §7 propagation
//! policy).
//!
//! Inbound connections accepted from peers we haven't dialed ourselves are
//! kept under a synthetic placeholder key purely to own their read loop; the
//! dispatcher still resolves the *sender* of a request to a real peer from
//! its source address for routing purposes (§4.6 step 2), but the *response*
//! to that request is written straight back on the accepted socket itself
//! (see `dispatch_inbound`) rather than being looked up by peer UUID — an
//! accepted connection's placeholder key is never a usable destination for
//! `connection_for`. Fresh outbound traffic (`send`, and `send_response` for
//! a peer we dialed ourselves) goes through the connection cached under the
//! real peer UUID, dialing one if needed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use meshrpc_core::error::{Error, Result};
use meshrpc_core::peer::Peer;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelDelegate};
use crate::framing::{read_frame, write_frame, HeaderWidth};
use crate::pending::PendingCallbacks;

struct Connection {
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    reader_task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

type ConnectionMap = Arc<Mutex<HashMap<Uuid, Arc<Connection>>>>;

/// A reliable, TCP-backed channel shared by the system channel and any
/// per-command channels with `ChannelClass::Reliable`.
pub struct ReliableChannel {
    id: String,
    delegate: Arc<dyn ChannelDelegate>,
    pending: Arc<PendingCallbacks>,
    next_id: AtomicU32,
    connections: ConnectionMap,
    listener: Mutex<Option<(JoinHandle<()>, u16)>>,
    framing_cap: u64,
    header_width: HeaderWidth,
    /// Disables TCP_NODELAY coalescing for real-time P+S traffic (§3, §4.3).
    real_time: AtomicBool,
}

impl ReliableChannel {
    pub fn new(id: impl Into<String>, delegate: Arc<dyn ChannelDelegate>, framing_cap: u64, header_width: HeaderWidth) -> Self {
        Self {
            id: id.into(),
            delegate,
            pending: Arc::new(PendingCallbacks::new()),
            next_id: AtomicU32::new(1),
            connections: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
            framing_cap,
            header_width,
            real_time: AtomicBool::new(false),
        }
    }

    pub fn set_real_time(&self, real_time: bool) {
        self.real_time.store(real_time, Ordering::Relaxed);
    }

    pub fn pending(&self) -> Arc<PendingCallbacks> {
        Arc::clone(&self.pending)
    }

    /// Await a response previously registered via the pending table, with
    /// the given timeout. Removes the entry on timeout so a late response
    /// finds nothing and is a harmless no-op.
    pub async fn await_response(&self, peer: Uuid, id: u32, rx: oneshot::Receiver<Result<Value>>, timeout: std::time::Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&self.id, peer, id);
                Err(Error::Timeout)
            }
        }
    }

    async fn connection_for(&self, peer: &Peer) -> Result<Arc<Connection>> {
        {
            let connections = self.connections.lock().await;
            if let Some(conn) = connections.get(&peer.uuid) {
                return Ok(Arc::clone(conn));
            }
        }

        // Prefer the port advertised under this channel's own id (set by
        // per-command TXT entries for a dedicated P+S reliable channel);
        // fall back to the system port so the system channel itself (and
        // any test harness that never advertised a matching TXT key) still
        // resolves an address.
        let port = peer
            .port_for_command_name(&self.id)
            .or_else(|| peer.system_port())
            .ok_or_else(|| Error::PeerUnknown(peer.uuid.to_string()))?;
        let addr = peer
            .addresses
            .first()
            .map(|a| SocketAddr::new(a.ip(), port))
            .ok_or_else(|| Error::PeerUnknown(peer.uuid.to_string()))?;

        let stream = TcpStream::connect(addr).await?;
        self.adopt_connection(peer.uuid, addr, stream).await
    }

    async fn adopt_connection(&self, peer_uuid: Uuid, peer_addr: SocketAddr, stream: TcpStream) -> Result<Arc<Connection>> {
        let _ = stream.set_nodelay(self.real_time.load(Ordering::Relaxed));
        let (read_half, write_half) = stream.into_split();
        let conn = spawn_reader(
            read_half,
            Arc::clone(&self.delegate),
            Arc::clone(&self.pending),
            self.id.clone(),
            self.framing_cap,
            self.header_width,
            peer_uuid,
            peer_addr,
            write_half,
        );

        let mut connections = self.connections.lock().await;
        connections.insert(peer_uuid, Arc::clone(&conn));
        Ok(conn)
    }

    async fn write_value(&self, conn: &Connection, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        let mut write_half = conn.write_half.lock().await;
        write_frame(&mut *write_half, self.header_width, &body).await
    }

    pub fn next_request_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_reader(
    read_half: tokio::net::tcp::OwnedReadHalf,
    delegate: Arc<dyn ChannelDelegate>,
    pending: Arc<PendingCallbacks>,
    channel_id: String,
    cap: u64,
    width: HeaderWidth,
    peer_uuid: Uuid,
    peer_addr: SocketAddr,
    write_half: OwnedWriteHalf,
) -> Arc<Connection> {
    let write_half = Arc::new(Mutex::new(write_half));
    let reader_write_half = Arc::clone(&write_half);

    let reader_task = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            let body = match read_frame(&mut reader, width, cap).await {
                Ok(b) => b,
                Err(Error::FramingTooLarge { len, cap }) => {
                    warn!(len, cap, "reliable channel: frame exceeds cap, disconnecting");
                    delegate.handle_channel_error(&channel_id, Error::FramingTooLarge { len, cap }).await;
                    break;
                }
                Err(_) => break,
            };
            let value: Value = match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "reliable channel: decode failed");
                    continue;
                }
            };
            dispatch_inbound(&delegate, &pending, &channel_id, peer_uuid, peer_addr, value, &reader_write_half, width).await;
        }
        pending.fail_all_for_peer(&channel_id, peer_uuid);
    });

    Arc::new(Connection {
        write_half,
        reader_task,
    })
}

/// Handle one decoded inbound frame.
///
/// A request's response is written straight back on `write_half` — the same
/// socket it arrived on — rather than through `Channel::send_response`
/// (which looks a connection up by peer UUID and would re-dial for an
/// accepted connection, since those are keyed by a synthetic placeholder,
/// not the real sender's UUID). This is what makes R+R correlation work for
/// inbound requests at all: the client's own pending-callback entry is
/// registered and resolved against its *own* dialed connection, and a reply
/// only ever needs to retrace the path a request came in on.
async fn dispatch_inbound(
    delegate: &Arc<dyn ChannelDelegate>,
    pending: &Arc<PendingCallbacks>,
    channel_id: &str,
    peer_uuid: Uuid,
    peer_addr: SocketAddr,
    value: Value,
    write_half: &Arc<Mutex<OwnedWriteHalf>>,
    width: HeaderWidth,
) {
    use meshrpc_core::envelope::WireMessage;
    match WireMessage::from_value(value) {
        Ok(WireMessage::Request(req)) => {
            let id = req.id;
            if let Some(result) = delegate.handle_request(peer_addr, req.method, req.params, id).await {
                if id != meshrpc_core::constants::NOTIFICATION_ID {
                    let envelope = match result {
                        Ok(v) => meshrpc_core::envelope::ResponseEnvelope::ok(id, v),
                        Err(e) => meshrpc_core::envelope::ResponseEnvelope::err(id, e.to_payload()),
                    };
                    match serde_json::to_vec(&envelope) {
                        Ok(body) => {
                            let mut w = write_half.lock().await;
                            if let Err(e) = write_frame(&mut *w, width, &body).await {
                                warn!(error = %e, "reliable channel: failed to write response");
                            }
                        }
                        Err(e) => warn!(error = %e, "reliable channel: failed to encode response"),
                    }
                }
            }
        }
        Ok(WireMessage::Response(resp)) => {
            let id = resp.id;
            let result = resp.into_result();
            if !pending.complete(channel_id, peer_uuid, id, result) {
                debug!(id, "reliable channel: response for unknown/expired pending id");
            }
        }
        Err(e) => {
            warn!(error = %e, "reliable channel: malformed envelope");
        }
    }
}

#[async_trait]
impl Channel for ReliableChannel {
    async fn start(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::ChannelBindFailed(e.to_string()))?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| Error::ChannelBindFailed(e.to_string()))?
            .port();

        let connections = Arc::clone(&self.connections);
        let delegate = Arc::clone(&self.delegate);
        let pending = Arc::clone(&self.pending);
        let channel_id = self.id.clone();
        let cap = self.framing_cap;
        let width = self.header_width;

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "reliable channel: accept failed");
                        continue;
                    }
                };
                debug!(%addr, "reliable channel: accepted connection");
                let (read_half, write_half) = stream.into_split();
                // Accepted connections are keyed by a synthetic UUID purely
                // so this channel owns their read loop; this key is never
                // looked up by `connection_for`. Requests arriving here are
                // routed to a real peer by source address at the
                // dispatcher, and any response goes straight back out this
                // same socket (see `dispatch_inbound`).
                let placeholder = Uuid::new_v4();
                let conn = spawn_reader(
                    read_half,
                    Arc::clone(&delegate),
                    Arc::clone(&pending),
                    channel_id.clone(),
                    cap,
                    width,
                    placeholder,
                    addr,
                    write_half,
                );
                let mut guard = connections.lock().await;
                guard.insert(placeholder, conn);
            }
        });

        let mut listener_slot = self.listener.lock().await;
        *listener_slot = Some((accept_task, bound_port));
        Ok(())
    }

    async fn stop(&self) {
        let mut listener_slot = self.listener.lock().await;
        if let Some((task, _)) = listener_slot.take() {
            task.abort();
        }
        let mut connections = self.connections.lock().await;
        connections.clear();
    }

    async fn send(&self, peer: &Peer, method: &str, id: u32, params: Vec<Value>) -> Result<()> {
        let conn = self.connection_for(peer).await?;
        let request = meshrpc_core::envelope::RequestEnvelope { id, method: method.to_string(), params };
        let value = serde_json::to_value(&request)?;
        self.write_value(&conn, &value).await
    }

    async fn send_response(&self, peer: &Peer, id: u32, result: Result<Value>) -> Result<()> {
        let conn = self.connection_for(peer).await?;
        let envelope = match result {
            Ok(v) => meshrpc_core::envelope::ResponseEnvelope::ok(id, v),
            Err(e) => meshrpc_core::envelope::ResponseEnvelope::err(id, e.to_payload()),
        };
        let value = serde_json::to_value(&envelope)?;
        self.write_value(&conn, &value).await
    }

    async fn remove_peer(&self, peer_uuid: Uuid) {
        let mut connections = self.connections.lock().await;
        connections.remove(&peer_uuid);
        drop(connections);
        self.pending.fail_all_for_peer(&self.id, peer_uuid);
    }

    fn bound_port(&self) -> Option<u16> {
        self.listener.try_lock().ok().and_then(|g| g.as_ref().map(|(_, port)| *port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_core::error::Error as MeshError;
    use std::sync::atomic::AtomicUsize;

    struct EchoDelegate {
        requests_seen: AtomicUsize,
    }

    #[async_trait]
    impl ChannelDelegate for EchoDelegate {
        async fn handle_request(&self, _source_addr: SocketAddr, method: String, params: Vec<Value>, _id: u32) -> Option<Result<Value>> {
            self.requests_seen.fetch_add(1, Ordering::Relaxed);
            Some(Ok(Value::Array(vec![Value::String(method)].into_iter().chain(params).collect())))
        }

        async fn handle_response(&self, _channel: &str, _from: Uuid, _id: u32, _result: Result<Value>) {}

        async fn handle_channel_error(&self, _channel: &str, _error: MeshError) {}
    }

    fn loopback_peer(uuid: Uuid, port: u16) -> Peer {
        let mut peer = Peer::new(uuid, "meshrpc,1");
        peer.addresses.push(SocketAddr::new("127.0.0.1".parse().unwrap(), port));
        peer.set_port(port, meshrpc_core::constants::HEARTBEAT_COMMAND);
        peer
    }

    #[tokio::test]
    async fn send_opens_and_reuses_connection() {
        let delegate = Arc::new(EchoDelegate { requests_seen: AtomicUsize::new(0) });
        let server = Arc::new(ReliableChannel::new("system", delegate, 1 << 20, HeaderWidth::RequestResponse));
        server.start(0).await.unwrap();
        let port = server.bound_port().unwrap();

        let client_delegate = Arc::new(EchoDelegate { requests_seen: AtomicUsize::new(0) });
        let client = ReliableChannel::new("system", client_delegate, 1 << 20, HeaderWidth::RequestResponse);

        let peer = loopback_peer(Uuid::new_v4(), port);
        client.send(&peer, "_hb", 0, vec![]).await.unwrap();
        // second send reuses the cached connection rather than opening a new one.
        client.send(&peer, "_hb", 0, vec![]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.connections.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn request_response_round_trips_on_accepted_connection() {
        let delegate = Arc::new(EchoDelegate { requests_seen: AtomicUsize::new(0) });
        let server = Arc::new(ReliableChannel::new("system", delegate, 1 << 20, HeaderWidth::RequestResponse));
        server.start(0).await.unwrap();
        let port = server.bound_port().unwrap();

        let client_delegate = Arc::new(EchoDelegate { requests_seen: AtomicUsize::new(0) });
        let client = ReliableChannel::new("system", client_delegate, 1 << 20, HeaderWidth::RequestResponse);

        let peer = loopback_peer(Uuid::new_v4(), port);
        let id = client.next_request_id();
        let rx = client.pending().register("system".into(), peer.uuid, id);
        client.send(&peer, "_hb", id, vec![Value::String("ping".into())]).await.unwrap();

        let result = client
            .await_response(peer.uuid, id, rx, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, Value::Array(vec![Value::String("_hb".into()), Value::String("ping".into())]));
    }

    #[tokio::test]
    async fn remove_peer_fails_pending_callbacks() {
        let delegate = Arc::new(EchoDelegate { requests_seen: AtomicUsize::new(0) });
        let channel = ReliableChannel::new("system", delegate, 1 << 20, HeaderWidth::RequestResponse);
        let peer_uuid = Uuid::new_v4();
        let rx = channel.pending().register("system".into(), peer_uuid, 5);
        channel.remove_peer(peer_uuid).await;
        let result = rx.await.unwrap();
        assert!(matches!(result.unwrap_err(), MeshError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn await_response_times_out_when_no_reply_arrives() {
        let delegate = Arc::new(EchoDelegate { requests_seen: AtomicUsize::new(0) });
        let channel = ReliableChannel::new("system", delegate, 1 << 20, HeaderWidth::RequestResponse);
        let peer_uuid = Uuid::new_v4();
        let rx = channel.pending().register("system".into(), peer_uuid, 9);

        let result = channel.await_response(peer_uuid, 9, rx, std::time::Duration::from_secs(60)).await;
        assert!(matches!(result.unwrap_err(), MeshError::Timeout));
    }

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn _reliable_channel_is_send_sync() {
        assert_send_sync::<ReliableChannel>();
    }
}
