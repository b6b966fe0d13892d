//! Unreliable (UDP) channel (§4.3).
//!
//! Carries P+S notifications only (`id == 0`); no pending-callback table,
//! no per-peer connection cache. A send is addressed to
//! `peer.addresses[primary]:peer.port_for_command_name(method)` and the
//! receiver tolerates arbitrary reordering and loss.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use meshrpc_core::envelope::{RequestEnvelope, WireMessage};
use meshrpc_core::error::{Error, Result};
use meshrpc_core::peer::Peer;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::channel::{Channel, ChannelDelegate};

/// Oversize datagrams are not blocked, only warned about (§4.1): a single
/// packet much larger than this is likely to be fragmented or dropped by
/// the path MTU, but nothing here refuses to send it.
const SOFT_DATAGRAM_WARN_BYTES: usize = 1400;
const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

pub struct UnreliableChannel {
    delegate: Arc<dyn ChannelDelegate>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    bound_port: Mutex<Option<u16>>,
    channel_id: String,
}

impl UnreliableChannel {
    pub fn new(id: impl Into<String>, delegate: Arc<dyn ChannelDelegate>) -> Self {
        Self {
            delegate,
            socket: Mutex::new(None),
            recv_task: Mutex::new(None),
            bound_port: Mutex::new(None),
            channel_id: id.into(),
        }
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>> {
        let guard = self.socket.lock().await;
        guard
            .clone()
            .ok_or_else(|| Error::Internal(format!("unreliable channel '{}' not started", self.channel_id)))
    }
}

#[async_trait]
impl Channel for UnreliableChannel {
    async fn start(&self, port: u16) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::ChannelBindFailed(e.to_string()))?;
        let bound_port = socket.local_addr().map_err(|e| Error::ChannelBindFailed(e.to_string()))?.port();
        let socket = Arc::new(socket);

        let recv_socket = Arc::clone(&socket);
        let delegate = Arc::clone(&self.delegate);
        let channel_id = self.channel_id.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            loop {
                let (len, source_addr) = match recv_socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "unreliable channel: recv failed");
                        continue;
                    }
                };
                let value: Value = match serde_json::from_slice(&buf[..len]) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "unreliable channel: decode failed");
                        continue;
                    }
                };
                match WireMessage::from_value(value) {
                    Ok(WireMessage::Request(req)) => {
                        let _ = delegate.handle_request(source_addr, req.method, req.params, req.id).await;
                    }
                    Ok(WireMessage::Response(resp)) => {
                        warn!(%channel_id, id = resp.id, "unreliable channel: unexpected response envelope, dropping");
                    }
                    Err(e) => {
                        warn!(error = %e, "unreliable channel: malformed envelope");
                    }
                }
            }
        });

        *self.socket.lock().await = Some(socket);
        *self.recv_task.lock().await = Some(task);
        *self.bound_port.lock().await = Some(bound_port);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        *self.socket.lock().await = None;
        *self.bound_port.lock().await = None;
    }

    async fn send(&self, peer: &Peer, method: &str, id: u32, params: Vec<Value>) -> Result<()> {
        let socket = self.socket().await?;
        let port = peer
            .port_for_command_name(method)
            .ok_or_else(|| Error::PeerUnknown(peer.uuid.to_string()))?;
        let addr: SocketAddr = peer
            .addresses
            .first()
            .map(|a| SocketAddr::new(a.ip(), port))
            .ok_or_else(|| Error::PeerUnknown(peer.uuid.to_string()))?;

        let envelope = RequestEnvelope { id, method: method.to_string(), params };
        let body = serde_json::to_vec(&envelope)?;
        if body.len() > SOFT_DATAGRAM_WARN_BYTES {
            warn!(len = body.len(), %method, "unreliable channel: payload exceeds soft MTU budget, sending anyway");
        }
        socket.send_to(&body, addr).await?;
        Ok(())
    }

    async fn send_response(&self, _peer: &Peer, _id: u32, _result: Result<Value>) -> Result<()> {
        Err(Error::Internal("unreliable channel carries notifications only, not responses".into()))
    }

    async fn remove_peer(&self, _peer_uuid: Uuid) {
        // No per-peer connection state to tear down; unreliable sends are stateless.
    }

    fn bound_port(&self) -> Option<u16> {
        self.bound_port.try_lock().ok().and_then(|g| *g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshrpc_core::error::Error as MeshError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingDelegate {
        last_method: StdMutex<Option<String>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl ChannelDelegate for RecordingDelegate {
        async fn handle_request(&self, _source_addr: SocketAddr, method: String, _params: Vec<Value>, _id: u32) -> Option<Result<Value>> {
            self.count.fetch_add(1, Ordering::Relaxed);
            *self.last_method.lock().unwrap() = Some(method);
            None
        }

        async fn handle_response(&self, _channel: &str, _from: Uuid, _id: u32, _result: Result<Value>) {}

        async fn handle_channel_error(&self, _channel: &str, _error: MeshError) {}
    }

    fn loopback_peer(uuid: Uuid, port: u16) -> Peer {
        let mut peer = Peer::new(uuid, "meshrpc,1");
        peer.addresses.push(SocketAddr::new("127.0.0.1".parse().unwrap(), port));
        peer.set_port(port, "motion");
        peer
    }

    #[tokio::test]
    async fn send_delivers_notification_to_receiver() {
        let delegate = Arc::new(RecordingDelegate {
            last_method: StdMutex::new(None),
            count: AtomicUsize::new(0),
        });
        let server = UnreliableChannel::new("motion", Arc::clone(&delegate) as Arc<dyn ChannelDelegate>);
        server.start(0).await.unwrap();
        let port = server.bound_port().unwrap();

        let client_delegate = Arc::new(RecordingDelegate {
            last_method: StdMutex::new(None),
            count: AtomicUsize::new(0),
        });
        let client = UnreliableChannel::new("motion", client_delegate);
        client.start(0).await.unwrap();

        let peer = loopback_peer(Uuid::new_v4(), port);
        client.send(&peer, "motion", 0, vec![Value::Bool(true)]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(delegate.count.load(Ordering::Relaxed), 1);
        assert_eq!(delegate.last_method.lock().unwrap().as_deref(), Some("motion"));
    }

    #[tokio::test]
    async fn send_response_is_rejected() {
        let delegate = Arc::new(RecordingDelegate {
            last_method: StdMutex::new(None),
            count: AtomicUsize::new(0),
        });
        let channel = UnreliableChannel::new("motion", delegate);
        channel.start(0).await.unwrap();
        let peer = loopback_peer(Uuid::new_v4(), 1);
        let err = channel.send_response(&peer, 1, Ok(Value::Null)).await.unwrap_err();
        assert!(matches!(err, MeshError::Internal(_)));
    }
}
