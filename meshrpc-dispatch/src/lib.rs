//! Command registry, subscription manager, system commands, and the
//! dispatcher facade (§4.5–§4.8) tying channels, discovery, and user code
//! into the single public surface host applications build against.

pub mod delegate;
pub mod dispatcher;
pub mod executor;
pub mod registry;
pub mod subscription;
pub mod system;

pub use delegate::{ConnectorDelegate, DiscoveringPeerChange, DiscoveringPeersDelegate, NullConnectorDelegate};
pub use dispatcher::Dispatcher;
pub use executor::CallbackExecutor;
pub use registry::{CommandBehavior, CommandRegistry, Publisher, RegisteredCommand, RequestHandler};
pub use subscription::{IncomingSubscriber, OutgoingSubscription, ReceiveHandler, SubscriptionManager};
