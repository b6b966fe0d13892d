//! Channel abstraction (§4.3): three concrete transports share one
//! interface. The dispatcher talks to channels only through this trait and
//! the [`ChannelDelegate`] it hands each channel at construction time,
//! avoiding the Channel ↔ Dispatcher reference cycle the design notes call
//! out — channels hold a delegate callback, never an owning dispatcher
//! reference.

use std::net::SocketAddr;

use async_trait::async_trait;
use meshrpc_core::error::Result;
use meshrpc_core::peer::Peer;
use serde_json::Value;
use uuid::Uuid;

/// Invoked by a channel when it has decoded an inbound message. Implemented
/// by the dispatcher; channels never interpret message content themselves.
#[async_trait]
pub trait ChannelDelegate: Send + Sync {
    /// An inbound request/push arrived. The channel does not know the
    /// sender's UUID up front (only its source address); the dispatcher
    /// resolves the peer by address (§4.6 step 2) for routing purposes. For
    /// a stream-oriented channel the returned value is the response and the
    /// channel writes it straight back on the connection the request
    /// arrived on, without going through `Channel::send_response` (which is
    /// keyed by peer UUID and can't address an inbound-only connection).
    /// `send_response` remains the right call for a reply sent on its own,
    /// detached from handling the original request.
    async fn handle_request(&self, source_addr: SocketAddr, method: String, params: Vec<Value>, id: u32) -> Option<Result<Value>>;

    /// An inbound response to a previously-sent request arrived.
    async fn handle_response(&self, channel: &str, from: Uuid, id: u32, result: Result<Value>);

    /// The channel failed outside the context of any specific pending
    /// operation (e.g. bind failure). Mirrors `didFailWithError`.
    async fn handle_channel_error(&self, channel: &str, error: meshrpc_core::error::Error);
}

/// Shared lifecycle every concrete channel implements (§4.3).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Start listening. `port == 0` requests an OS-assigned port; the
    /// channel reports the bound port back via `bound_port()`.
    async fn start(&self, port: u16) -> Result<()>;

    async fn stop(&self);

    /// Encode and send `params` under `method` to `peer`. `id == 0` sends a
    /// notification (P+S push); a non-zero `id` is an R+R request and the
    /// caller is expected to await the matching response separately (via
    /// the pending-callback table, not this call).
    async fn send(&self, peer: &Peer, method: &str, id: u32, params: Vec<Value>) -> Result<()>;

    /// Send a response envelope back to `peer` for a previously-received
    /// request `id` (R+R server side).
    async fn send_response(&self, peer: &Peer, id: u32, result: Result<Value>) -> Result<()>;

    /// Drop all connection/association state for `peer` (e.g. on peer
    /// removal): closes the cached TCP connection and fails its pending
    /// callbacks with `CONNECTION_CLOSED`.
    async fn remove_peer(&self, peer_uuid: Uuid);

    /// The port this channel is actually listening on, once started.
    fn bound_port(&self) -> Option<u16>;
}
