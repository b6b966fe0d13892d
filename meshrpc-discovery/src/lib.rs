//! Discovery layer (§4.4): mDNS/DNS-SD peer publication and browsing, the
//! heartbeat-gated visibility handshake, and grace-period peer retention.
//!
//! This crate owns the `mdns-sd` `ServiceDaemon` and the peer table it
//! drives; it never talks to sockets directly for anything other than
//! mDNS itself. Confirming a newly-resolved peer as *visible* requires a
//! successful `_hb` round trip, which this crate delegates to a
//! [`HeartbeatSink`] supplied by the caller (the dispatcher, which owns
//! the reliable system channel) rather than owning RPC machinery itself.

mod discovery;

pub use discovery::{Discovery, DiscoveryConfig, HeartbeatSink, PeerEvent};
