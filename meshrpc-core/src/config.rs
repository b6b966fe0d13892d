//! Pluggable configuration (§6 "Configuration delegate", §9 design note on
//! delegate-protocol polymorphism). A concrete type implementing this trait
//! stands in for the source's `TMFConfigurationDelegate`; [`DefaultConfiguration`]
//! provides the framework's stock choices.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_FRAMING_CAP, DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT, DEFAULT_SERVICE_DOMAIN,
    DEFAULT_SERVICE_TYPE, HEARTBEAT_GRACE, HEARTBEAT_INTERVAL, MULTICAST_DEDUP_WINDOW, RESPONSE_TIMEOUT,
};

/// Knobs a host application may want to override without reimplementing the
/// rest of the framework's wiring. Every method has a default matching the
/// library's stock behavior, so implementers only override what they need.
pub trait ConfigurationDelegate: Send + Sync {
    /// mDNS domain commands are browsed/published in.
    fn service_domain(&self) -> String {
        DEFAULT_SERVICE_DOMAIN.to_string()
    }

    /// mDNS service type identifying this protocol family.
    fn service_type(&self) -> String {
        DEFAULT_SERVICE_TYPE.to_string()
    }

    /// `name,version` identifier used to reject incompatible peers.
    fn protocol_identifier(&self) -> String;

    /// Human-readable instance name advertised over mDNS.
    fn instance_name(&self) -> String;

    fn multicast_group(&self) -> Ipv4Addr {
        DEFAULT_MULTICAST_GROUP.parse().expect("valid default multicast group")
    }

    fn multicast_port(&self) -> u16 {
        DEFAULT_MULTICAST_PORT
    }

    fn multicast_dedup_window(&self) -> Duration {
        MULTICAST_DEDUP_WINDOW
    }

    fn heartbeat_grace(&self) -> Duration {
        HEARTBEAT_GRACE
    }

    fn heartbeat_interval(&self) -> Duration {
        HEARTBEAT_INTERVAL
    }

    fn response_timeout(&self) -> Duration {
        RESPONSE_TIMEOUT
    }

    fn framing_cap(&self) -> u64 {
        DEFAULT_FRAMING_CAP
    }
}

/// A ready-to-use [`ConfigurationDelegate`] for a given protocol identifier
/// and instance name, with every other knob left at the library default.
#[derive(Debug, Clone)]
pub struct DefaultConfiguration {
    pub protocol_identifier: String,
    pub instance_name: String,
}

impl DefaultConfiguration {
    pub fn new(protocol_identifier: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            protocol_identifier: protocol_identifier.into(),
            instance_name: instance_name.into(),
        }
    }
}

impl ConfigurationDelegate for DefaultConfiguration {
    fn protocol_identifier(&self) -> String {
        self.protocol_identifier.clone()
    }

    fn instance_name(&self) -> String {
        self.instance_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_uses_stock_knobs() {
        let cfg = DefaultConfiguration::new("meshrpc,1", "test-peer");
        assert_eq!(cfg.service_type(), DEFAULT_SERVICE_TYPE);
        assert_eq!(cfg.multicast_port(), DEFAULT_MULTICAST_PORT);
        assert_eq!(cfg.heartbeat_grace(), HEARTBEAT_GRACE);
    }
}
