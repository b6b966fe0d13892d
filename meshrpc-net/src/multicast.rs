//! Multicast channel (§4.3): a UDP channel additionally joined to a
//! configured multicast group/port. Sends go to the group; receives are
//! de-duplicated by `(sender uuid, id)` within [`MulticastChannel::new`]'s
//! `dedup_window`, and a peer never processes its own sends.
//!
//! The reference envelope schema (§6) carries no sender identity, which
//! multicast de-duplication needs; this channel wraps the ordinary
//! [`RequestEnvelope`] in a small `{sender, envelope}` shape on the wire
//! for multicast traffic only. Reliable and unreliable traffic are
//! unaffected.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meshrpc_core::envelope::RequestEnvelope;
use meshrpc_core::error::{Error, Result};
use meshrpc_core::peer::Peer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::channel::{Channel, ChannelDelegate};

const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MulticastEnvelope {
    sender: Uuid,
    #[serde(flatten)]
    request: RequestEnvelope,
}

pub struct MulticastChannel {
    local_uuid: Uuid,
    group: Ipv4Addr,
    group_port: u16,
    dedup_window: Duration,
    delegate: Arc<dyn ChannelDelegate>,
    send_socket: Mutex<Option<Arc<UdpSocket>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    seen: Arc<Mutex<HashMap<(Uuid, u32), Instant>>>,
    channel_id: String,
}

impl MulticastChannel {
    pub fn new(
        id: impl Into<String>,
        local_uuid: Uuid,
        group: Ipv4Addr,
        group_port: u16,
        dedup_window: Duration,
        delegate: Arc<dyn ChannelDelegate>,
    ) -> Self {
        Self {
            local_uuid,
            group,
            group_port,
            dedup_window,
            delegate,
            send_socket: Mutex::new(None),
            recv_task: Mutex::new(None),
            seen: Arc::new(Mutex::new(HashMap::new())),
            channel_id: id.into(),
        }
    }

    async fn bind_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
        let addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        Ok(socket)
    }

    /// `true` if `(sender, id)` was seen within the dedup window; inserts
    /// or refreshes the entry either way and evicts stale entries.
    async fn is_duplicate(&self, sender: Uuid, id: u32) -> bool {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        seen.retain(|_, ts| now.duration_since(*ts) < self.dedup_window);
        let key = (sender, id);
        if seen.contains_key(&key) {
            true
        } else {
            seen.insert(key, now);
            false
        }
    }
}

#[async_trait]
impl Channel for MulticastChannel {
    async fn start(&self, _port: u16) -> Result<()> {
        let socket = Self::bind_multicast_socket(self.group, self.group_port)
            .await
            .map_err(|e| Error::ChannelBindFailed(e.to_string()))?;
        let socket = Arc::new(socket);

        let recv_socket = Arc::clone(&socket);
        let delegate = Arc::clone(&self.delegate);
        let local_uuid = self.local_uuid;
        let seen = Arc::clone(&self.seen);
        let dedup_window = self.dedup_window;
        let channel_id = self.channel_id.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            loop {
                let (len, source_addr) = match recv_socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "multicast channel: recv failed");
                        continue;
                    }
                };
                let envelope: MulticastEnvelope = match serde_json::from_slice(&buf[..len]) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "multicast channel: decode failed");
                        continue;
                    }
                };
                if envelope.sender == local_uuid {
                    continue; // never loop back our own sends.
                }

                let mut seen_guard = seen.lock().await;
                let now = Instant::now();
                seen_guard.retain(|_, ts| now.duration_since(*ts) < dedup_window);
                let key = (envelope.sender, envelope.request.id);
                if seen_guard.contains_key(&key) {
                    continue;
                }
                seen_guard.insert(key, now);
                drop(seen_guard);

                let _ = delegate
                    .handle_request(source_addr, envelope.request.method, envelope.request.params, envelope.request.id)
                    .await;
            }
        });

        *self.send_socket.lock().await = Some(socket);
        *self.recv_task.lock().await = Some(task);
        let _ = channel_id;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        *self.send_socket.lock().await = None;
    }

    async fn send(&self, _peer: &Peer, method: &str, id: u32, params: Vec<Value>) -> Result<()> {
        let guard = self.send_socket.lock().await;
        let socket = guard
            .clone()
            .ok_or_else(|| Error::Internal(format!("multicast channel '{}' not started", self.channel_id)))?;
        drop(guard);

        let envelope = MulticastEnvelope {
            sender: self.local_uuid,
            request: RequestEnvelope { id, method: method.to_string(), params },
        };
        let body = serde_json::to_vec(&envelope)?;
        let group_addr = SocketAddr::new(IpAddr::V4(self.group), self.group_port);
        socket.send_to(&body, group_addr).await?;
        Ok(())
    }

    async fn send_response(&self, _peer: &Peer, _id: u32, _result: Result<Value>) -> Result<()> {
        Err(Error::Internal("multicast channel carries notifications only, not responses".into()))
    }

    async fn remove_peer(&self, _peer_uuid: Uuid) {
        // Multicast has no per-peer connection state; dedup state is
        // global to the channel, not scoped to a single sender.
    }

    fn bound_port(&self) -> Option<u16> {
        Some(self.group_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDelegate {
        count: AtomicUsize,
    }

    #[async_trait]
    impl ChannelDelegate for CountingDelegate {
        async fn handle_request(&self, _source_addr: SocketAddr, _method: String, _params: Vec<Value>, _id: u32) -> Option<Result<Value>> {
            self.count.fetch_add(1, Ordering::Relaxed);
            None
        }

        async fn handle_response(&self, _channel: &str, _from: Uuid, _id: u32, _result: Result<Value>) {}

        async fn handle_channel_error(&self, _channel: &str, _error: meshrpc_core::error::Error) {}
    }

    #[tokio::test]
    async fn dedup_suppresses_repeat_within_window() {
        let delegate = Arc::new(CountingDelegate { count: AtomicUsize::new(0) });
        let channel = MulticastChannel::new(
            "multicast",
            Uuid::new_v4(),
            "239.255.0.1".parse().unwrap(),
            0,
            Duration::from_millis(200),
            delegate,
        );
        let sender = Uuid::new_v4();
        assert!(!channel.is_duplicate(sender, 1).await);
        assert!(channel.is_duplicate(sender, 1).await);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!channel.is_duplicate(sender, 1).await);
    }
}
