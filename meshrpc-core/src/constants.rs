//! Tunables called out by the design as "SHOULD be configuration knobs".
//! These are the framework's stock defaults; a [`crate::config::ConfigurationDelegate`]
//! may override any of them.

use std::time::Duration;

/// How long a peer is retained after its mDNS advertisement is withdrawn
/// before `willRemovePeer` fires and the record is destroyed.
pub const HEARTBEAT_GRACE: Duration = Duration::from_secs(120);

/// Interval on which the dispatcher re-sends `_hb` to every visible peer.
/// Deliberately shorter than [`HEARTBEAT_GRACE`] so a peer gets several
/// chances to answer before it is dropped.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Default deadline for a pending R+R response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Multicast duplicate-suppression window, keyed by `(sender uuid, id)`.
pub const MULTICAST_DEDUP_WINDOW: Duration = Duration::from_secs(1);

/// Reliable-stream length-prefix header width for request/response traffic.
pub const RR_HEADER_BYTES: usize = 4;

/// Reliable-stream length-prefix header width for publish/subscribe traffic.
pub const PS_HEADER_BYTES: usize = 2;

/// Default cap on a declared frame length; larger headers fail with
/// `FRAMING_TOO_LARGE`.
pub const DEFAULT_FRAMING_CAP: u64 = 16 * 1024 * 1024;

/// Default multicast group/port used unless overridden by configuration.
pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.0.1";
pub const DEFAULT_MULTICAST_PORT: u16 = 7475;

/// Default mDNS service type and domain.
pub const DEFAULT_SERVICE_TYPE: &str = "_meshrpc._tcp.local.";
pub const DEFAULT_SERVICE_DOMAIN: &str = "local.";

/// Prefix reserved for system commands; never publishable by user code.
pub const SYSTEM_COMMAND_PREFIX: char = '_';

/// Names of the built-in system commands.
pub const HEARTBEAT_COMMAND: &str = "_hb";
pub const SUBSCRIBE_COMMAND: &str = "_sub";
pub const UNSUBSCRIBE_COMMAND: &str = "_unsub";
pub const DISCONNECT_COMMAND: &str = "_disc";
pub const CAPABILITY_COMMAND: &str = "_cap";
pub const ANNOUNCE_COMMAND_PREFIX: &str = "_ann";

pub const SYSTEM_COMMANDS: &[&str] = &[
    HEARTBEAT_COMMAND,
    SUBSCRIBE_COMMAND,
    UNSUBSCRIBE_COMMAND,
    DISCONNECT_COMMAND,
    CAPABILITY_COMMAND,
];

/// `id == 0` is reserved for notifications (no response expected).
pub const NOTIFICATION_ID: u32 = 0;
