//! Command descriptors (§3, §4.5, design note on abstract command classes).
//!
//! A command is a *value*, not a subclass: `CommandDescriptor` carries the
//! name/channel-affinity/pattern data every command needs, and
//! `CommandPattern` is a tagged union over the two operation shapes (R+R,
//! P+S) instead of a class hierarchy. The registry in `meshrpc-dispatch`
//! pairs a descriptor with the behavior (a request handler, or a
//! publisher's start/stop hooks) appropriate to its pattern.

use serde::{Deserialize, Serialize};

use crate::constants::SYSTEM_COMMAND_PREFIX;
use crate::error::{Error, Result};

/// Transport a command's traffic rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelClass {
    Reliable,
    Unreliable,
    Multicast,
}

/// P+S-only attributes (§3).
#[derive(Debug, Clone, Default)]
pub struct PublishSubscribeOptions {
    /// Disables small-write coalescing (`TCP_NODELAY`) on the reliable
    /// channel carrying this command's traffic.
    pub is_real_time: bool,
    /// Whether a changed subscribe configuration should restart the
    /// publisher (stop, apply, start) rather than apply in place.
    pub restart_on_configuration_update: bool,
}

/// The operation shape of a command: request/response or publish/subscribe.
#[derive(Debug, Clone)]
pub enum CommandPattern {
    RequestResponse,
    PublishSubscribe(PublishSubscribeOptions),
}

impl CommandPattern {
    pub fn is_publish_subscribe(&self) -> bool {
        matches!(self, CommandPattern::PublishSubscribe(_))
    }
}

/// A published (or about-to-be-published) command's static shape.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub channel_class: ChannelClass,
    pub pattern: CommandPattern,
    pub is_system: bool,
}

impl CommandDescriptor {
    fn new(name: impl Into<String>, channel_class: ChannelClass, pattern: CommandPattern, is_system: bool) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Internal("command name must not be empty".into()));
        }
        let starts_with_prefix = name.starts_with(SYSTEM_COMMAND_PREFIX);
        if starts_with_prefix && !is_system {
            return Err(Error::Internal(format!(
                "command name '{name}' uses the reserved system prefix '_'"
            )));
        }
        if !starts_with_prefix && is_system {
            return Err(Error::Internal(format!(
                "system command '{name}' must use the reserved '_' prefix"
            )));
        }
        Ok(Self {
            name,
            channel_class,
            pattern,
            is_system,
        })
    }

    /// A user-defined request/response command.
    pub fn request_response(name: impl Into<String>, channel_class: ChannelClass) -> Result<Self> {
        Self::new(name, channel_class, CommandPattern::RequestResponse, false)
    }

    /// A user-defined publish/subscribe command.
    pub fn publish_subscribe(name: impl Into<String>, channel_class: ChannelClass, options: PublishSubscribeOptions) -> Result<Self> {
        Self::new(name, channel_class, CommandPattern::PublishSubscribe(options), false)
    }

    /// Construct one of the six built-in system commands. Only
    /// `meshrpc-dispatch` calls this; user code goes through
    /// `request_response`/`publish_subscribe`, which reject the `_` prefix.
    pub fn system(name: impl Into<String>, channel_class: ChannelClass) -> Result<Self> {
        Self::new(name, channel_class, CommandPattern::RequestResponse, true)
    }

    pub fn is_reliable_channel(&self) -> bool {
        matches!(self.channel_class, ChannelClass::Reliable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_underscore_prefixed_user_commands() {
        let err = CommandDescriptor::request_response("_hb", ChannelClass::Reliable).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn system_commands_require_prefix() {
        let err = CommandDescriptor::system("hb", ChannelClass::Reliable).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(CommandDescriptor::system("_hb", ChannelClass::Reliable).is_ok());
    }

    #[test]
    fn publish_subscribe_carries_options() {
        let cmd = CommandDescriptor::publish_subscribe(
            "motion",
            ChannelClass::Unreliable,
            PublishSubscribeOptions {
                is_real_time: true,
                restart_on_configuration_update: false,
            },
        )
        .unwrap();
        assert!(cmd.pattern.is_publish_subscribe());
    }
}
