//! Command Registry (§4.5): the local publish set, keyed by command name,
//! plus the allowlist that reserves `_`-prefixed names for system use.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use meshrpc_core::command::CommandDescriptor;
use meshrpc_core::error::{Error, Result};
use meshrpc_core::peer::Peer;
use serde_json::Value;

/// A user-supplied R+R handler: given the calling peer and decoded params,
/// produces the response (or error) to send back.
pub type RequestHandler = Arc<dyn Fn(Peer, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Start/stop hooks for a P+S command's publisher, invoked on the
/// subscriber-count 0↔1 transitions (§4.6 "Publisher lifecycle
/// transitions"). `name` in the trait methods mirrors the abstract
/// command class's own `start(completion)`/`stop(completion)` from the
/// source design, modeled here as async trait methods rather than
/// callback parameters.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);

    /// Apply a new subscribe configuration in place. Only called between a
    /// `stop`/`start` pair when `restart_on_configuration_update` is set
    /// (§4.6 step 3); publishers that ignore configuration entirely can
    /// leave the default no-op.
    async fn apply_configuration(&self, _configuration: Option<Value>) {}
}

/// The operation-specific behavior paired with a [`CommandDescriptor`] in
/// the registry; see the design note on abstract command classes mapping
/// to tagged data rather than a class hierarchy.
pub enum CommandBehavior {
    RequestResponse(RequestHandler),
    PublishSubscribe {
        publisher: Arc<dyn Publisher>,
        restart_on_configuration_update: bool,
    },
}

impl CommandBehavior {
    pub fn is_publish_subscribe(&self) -> bool {
        matches!(self, CommandBehavior::PublishSubscribe { .. })
    }
}

pub struct RegisteredCommand {
    pub descriptor: CommandDescriptor,
    pub behavior: CommandBehavior,
}

/// Stores the set of published commands keyed by command name (§4.5).
#[derive(Default)]
pub struct CommandRegistry {
    commands: tokio::sync::Mutex<HashMap<String, RegisteredCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a second publish of the same name with `DUPLICATE_COMMAND`
    /// (§4.5). System-command names are reserved; `CommandDescriptor`'s own
    /// constructors already refuse a non-system command starting with `_`,
    /// so this only needs to guard against duplicates.
    pub async fn publish(&self, command: RegisteredCommand) -> Result<()> {
        let mut commands = self.commands.lock().await;
        if commands.contains_key(&command.descriptor.name) {
            return Err(Error::DuplicateCommand(command.descriptor.name));
        }
        commands.insert(command.descriptor.name.clone(), command);
        Ok(())
    }

    pub async fn unpublish(&self, name: &str) -> Result<RegisteredCommand> {
        let mut commands = self.commands.lock().await;
        commands.remove(name).ok_or_else(|| Error::UnknownCommand(name.to_string()))
    }

    pub async fn descriptor(&self, name: &str) -> Option<CommandDescriptor> {
        let commands = self.commands.lock().await;
        commands.get(name).map(|c| c.descriptor.clone())
    }

    pub async fn is_published(&self, name: &str) -> bool {
        let commands = self.commands.lock().await;
        commands.contains_key(name)
    }

    pub async fn request_handler(&self, name: &str) -> Option<RequestHandler> {
        let commands = self.commands.lock().await;
        match &commands.get(name)?.behavior {
            CommandBehavior::RequestResponse(handler) => Some(Arc::clone(handler)),
            CommandBehavior::PublishSubscribe { .. } => None,
        }
    }

    pub async fn publisher(&self, name: &str) -> Option<(Arc<dyn Publisher>, bool)> {
        let commands = self.commands.lock().await;
        match &commands.get(name)?.behavior {
            CommandBehavior::PublishSubscribe { publisher, restart_on_configuration_update } => {
                Some((Arc::clone(publisher), *restart_on_configuration_update))
            }
            CommandBehavior::RequestResponse(_) => None,
        }
    }

    /// Every published, non-system command name; this is what gets
    /// advertised in the mDNS `cap` TXT entry and what `_cap` answers with.
    pub async fn capability_names(&self) -> HashSet<String> {
        let commands = self.commands.lock().await;
        commands.values().filter(|c| !c.descriptor.is_system).map(|c| c.descriptor.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_core::command::ChannelClass;

    fn rr_command(name: &str) -> RegisteredCommand {
        RegisteredCommand {
            descriptor: CommandDescriptor::request_response(name, ChannelClass::Reliable).unwrap(),
            behavior: CommandBehavior::RequestResponse(Arc::new(|_peer, _params| Box::pin(async { Ok(Value::Null) }))),
        }
    }

    #[tokio::test]
    async fn publish_rejects_duplicate() {
        let registry = CommandRegistry::new();
        registry.publish(rr_command("echo")).await.unwrap();
        let err = registry.publish(rr_command("echo")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateCommand(_)));
    }

    #[tokio::test]
    async fn unpublish_removes_and_reports_unknown_after() {
        let registry = CommandRegistry::new();
        registry.publish(rr_command("echo")).await.unwrap();
        registry.unpublish("echo").await.unwrap();
        let err = registry.unpublish("echo").await.unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn capability_names_excludes_system_commands() {
        let registry = CommandRegistry::new();
        registry.publish(rr_command("echo")).await.unwrap();
        registry
            .publish(RegisteredCommand {
                descriptor: CommandDescriptor::system("_hb", ChannelClass::Reliable).unwrap(),
                behavior: CommandBehavior::RequestResponse(Arc::new(|_peer, _params| Box::pin(async { Ok(Value::Null) }))),
            })
            .await
            .unwrap();

        let caps = registry.capability_names().await;
        assert!(caps.contains("echo"));
        assert!(!caps.contains("_hb"));
    }
}
