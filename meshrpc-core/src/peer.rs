//! Peer record (§3, §4.2): identity, addresses, per-command ports, and the
//! capability diff TXT updates drive.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use uuid::Uuid;

use crate::constants::{CAPABILITY_COMMAND, HEARTBEAT_COMMAND};

/// TXT record key names (§4.2).
pub mod txt_keys {
    pub const UUID: &str = "uuid";
    pub const PROTOCOL_ID: &str = "pid";
    pub const SYSTEM_PORT: &str = "sp";
    pub const CAPABILITIES: &str = "cap";
}

/// A remote (or local) participant in the mesh.
///
/// Invariants upheld by the owner of this record (the discovery layer /
/// dispatcher), not by the struct itself:
/// - `uuid` is unique within a session.
/// - `capabilities` always reflects the latest TXT record.
/// - `port_by_command_name[HEARTBEAT_COMMAND] == system_port`.
/// - becomes *visible* (tracked elsewhere, see `meshrpc-discovery`) only
///   after a heartbeat from it has been received.
#[derive(Debug, Clone)]
pub struct Peer {
    pub uuid: Uuid,
    pub protocol_identifier: String,
    pub name: String,
    pub host_name: String,
    pub domain: String,
    pub addresses: Vec<SocketAddr>,
    pub capabilities: HashSet<String>,
    pub previous_capabilities: HashSet<String>,
    pub did_change_capabilities_on_last_update: bool,
    pub port_by_command_name: HashMap<String, u16>,
}

impl Peer {
    pub fn new(uuid: Uuid, protocol_identifier: impl Into<String>) -> Self {
        Self {
            uuid,
            protocol_identifier: protocol_identifier.into(),
            name: String::new(),
            host_name: String::new(),
            domain: String::new(),
            addresses: Vec::new(),
            capabilities: HashSet::new(),
            previous_capabilities: HashSet::new(),
            did_change_capabilities_on_last_update: false,
            port_by_command_name: HashMap::new(),
        }
    }

    /// Parse a TXT record (as produced by `encode_txt`) and merge it into
    /// this peer, capturing the prior capability set into
    /// `previous_capabilities` and updating the change flag.
    pub fn update_from_txt(&mut self, txt: &HashMap<String, String>) {
        if let Some(sp) = txt.get(txt_keys::SYSTEM_PORT).and_then(|s| s.parse().ok()) {
            self.set_port(sp, HEARTBEAT_COMMAND);
        }
        if let Some(pid) = txt.get(txt_keys::PROTOCOL_ID) {
            self.protocol_identifier = pid.clone();
        }

        let new_caps: HashSet<String> = txt
            .get(txt_keys::CAPABILITIES)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        self.previous_capabilities = std::mem::replace(&mut self.capabilities, new_caps);
        self.did_change_capabilities_on_last_update = self.capabilities != self.previous_capabilities;

        for (key, value) in txt {
            if key == txt_keys::UUID || key == txt_keys::PROTOCOL_ID || key == txt_keys::SYSTEM_PORT || key == txt_keys::CAPABILITIES {
                continue;
            }
            if let Ok(port) = value.parse::<u16>() {
                self.port_by_command_name.insert(key.clone(), port);
            }
        }
    }

    /// Encode this peer's state into the TXT key/value pairs published over
    /// mDNS (§4.2). `system_port` is the port of the reliable system
    /// channel; `port_by_command_name` carries the further optional
    /// per-command ports the TXT layout allows (dedicated P+S channels
    /// that aren't the system channel or the well-known multicast port).
    pub fn encode_txt(
        uuid: Uuid,
        protocol_identifier: &str,
        system_port: u16,
        capabilities: &HashSet<String>,
        port_by_command_name: &HashMap<String, u16>,
    ) -> HashMap<String, String> {
        let mut txt = HashMap::new();
        txt.insert(txt_keys::UUID.to_string(), uuid.to_string());
        txt.insert(txt_keys::PROTOCOL_ID.to_string(), protocol_identifier.to_string());
        txt.insert(txt_keys::SYSTEM_PORT.to_string(), system_port.to_string());
        let mut caps: Vec<&String> = capabilities.iter().collect();
        caps.sort();
        let joined = caps.into_iter().cloned().collect::<Vec<_>>().join(",");
        txt.insert(txt_keys::CAPABILITIES.to_string(), joined);
        for (command_name, port) in port_by_command_name {
            txt.insert(command_name.clone(), port.to_string());
        }
        txt
    }

    /// Extract just the session UUID from a TXT record, without building a
    /// full `Peer`. Used by discovery before it decides whether a service is
    /// worth resolving further.
    pub fn uuid_from_txt(txt: &HashMap<String, String>) -> Option<Uuid> {
        txt.get(txt_keys::UUID).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// IP-only comparison, ignoring port (§4.2).
    pub fn has_address(&self, addr: IpAddr) -> bool {
        self.addresses.iter().any(|a| a.ip() == addr)
    }

    pub fn set_port(&mut self, port: u16, command_name: impl Into<String>) {
        self.port_by_command_name.insert(command_name.into(), port);
    }

    pub fn port_for_command_name(&self, command_name: &str) -> Option<u16> {
        self.port_by_command_name.get(command_name).copied()
    }

    /// The peer's primary address, i.e. the first non-unspecified address
    /// with a known port for the given command.
    pub fn primary_address_for_command(&self, command_name: &str) -> Option<SocketAddr> {
        let port = self.port_for_command_name(command_name)?;
        self.addresses.first().map(|a| SocketAddr::new(a.ip(), port))
    }

    pub fn system_port(&self) -> Option<u16> {
        self.port_for_command_name(HEARTBEAT_COMMAND)
    }

    pub fn has_capability(&self, command_name: &str) -> bool {
        self.capabilities.contains(command_name)
    }

    /// True if `self.capabilities` is a superset of `required`, used by
    /// discovery-filtering (§4.7) to decide Found/Update/Remove transitions.
    pub fn satisfies(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

// `_cap` queries a peer directly when its TXT is believed stale; keep the
// constant referenced here so the module documents the relationship even
// though the actual request lives in meshrpc-dispatch.
#[allow(dead_code)]
const _: &str = CAPABILITY_COMMAND;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_txt(caps: &str) -> HashMap<String, String> {
        let mut txt = HashMap::new();
        txt.insert(txt_keys::UUID.into(), Uuid::nil().to_string());
        txt.insert(txt_keys::PROTOCOL_ID.into(), "meshrpc,1".into());
        txt.insert(txt_keys::SYSTEM_PORT.into(), "4000".into());
        txt.insert(txt_keys::CAPABILITIES.into(), caps.into());
        txt
    }

    #[test]
    fn update_from_txt_tracks_previous_capabilities() {
        let mut peer = Peer::new(Uuid::nil(), "meshrpc,1");
        peer.update_from_txt(&sample_txt("loc,motion"));
        assert!(peer.did_change_capabilities_on_last_update);
        assert_eq!(peer.system_port(), Some(4000));
        assert!(peer.previous_capabilities.is_empty());

        peer.update_from_txt(&sample_txt("motion"));
        assert!(peer.did_change_capabilities_on_last_update);
        assert!(peer.previous_capabilities.contains("loc"));
        assert!(!peer.capabilities.contains("loc"));

        peer.update_from_txt(&sample_txt("motion"));
        assert!(!peer.did_change_capabilities_on_last_update);
    }

    #[test]
    fn encode_txt_sorts_capabilities_deterministically() {
        let mut caps = HashSet::new();
        caps.insert("b".to_string());
        caps.insert("a".to_string());
        let txt = Peer::encode_txt(Uuid::nil(), "meshrpc,1", 9000, &caps, &HashMap::new());
        assert_eq!(txt.get(txt_keys::CAPABILITIES).unwrap(), "a,b");
    }

    #[test]
    fn has_address_ignores_port() {
        let mut peer = Peer::new(Uuid::nil(), "meshrpc,1");
        peer.addresses.push("10.0.0.5:1234".parse().unwrap());
        assert!(peer.has_address("10.0.0.5".parse().unwrap()));
        assert!(!peer.has_address("10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn satisfies_checks_capability_superset() {
        let mut peer = Peer::new(Uuid::nil(), "meshrpc,1");
        peer.capabilities.insert("loc".into());
        peer.capabilities.insert("motion".into());
        let mut required = HashSet::new();
        required.insert("loc".into());
        assert!(peer.satisfies(&required));
        required.insert("missing".into());
        assert!(!peer.satisfies(&required));
    }
}
