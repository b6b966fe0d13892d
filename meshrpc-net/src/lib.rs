//! Channel abstraction and framing protocol (§4.3) for `meshrpc`.
//!
//! Three concrete [`Channel`] implementations share one interface: a
//! reliable (TCP) channel with per-peer connection caching and a
//! pending-callback table for R+R correlation, an unreliable (UDP) channel
//! for bare notifications, and a multicast channel layered on UDP with
//! sender/id de-duplication.

pub mod channel;
pub mod framing;
pub mod multicast;
pub mod pending;
pub mod reliable;
pub mod unreliable;

pub use channel::{Channel, ChannelDelegate};
pub use framing::HeaderWidth;
pub use multicast::MulticastChannel;
pub use pending::PendingCallbacks;
pub use reliable::ReliableChannel;
pub use unreliable::UnreliableChannel;
