//! Shared data model for `meshrpc`, a peer-to-peer RPC framework for
//! local-network service exchange.
//!
//! This crate covers the Codec & Framing (partially; wire framing itself
//! lives in `meshrpc-net`) and Peer Record layers of the coordination
//! engine, plus the error type and configuration trait every other
//! workspace crate builds on.

pub mod codec;
pub mod command;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod peer;

pub use command::{ChannelClass, CommandDescriptor, CommandPattern, PublishSubscribeOptions};
pub use config::{ConfigurationDelegate, DefaultConfiguration};
pub use envelope::{RequestEnvelope, ResponseEnvelope, WireMessage};
pub use error::{Error, ErrorPayload, Result};
pub use peer::Peer;
