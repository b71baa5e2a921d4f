// MCP relay: method dispatch, tool providers, upstream transports and
// backing-process sessions, plus the stdio bridge that ties them together.

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod forward;
pub mod handler;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod stdio;
pub mod upstream;

pub use builder::{build, Relay};
pub use config::RelayConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use forward::{Forwarder, Passthrough};
pub use handler::{ConnectionState, MessageHandler, Principal, RequestContext};
pub use provider::{ProviderError, ProviderRegistry, ToolProvider, Visibility};
pub use session::{SessionManager, SessionPhase};
pub use stdio::StdioBridge;
