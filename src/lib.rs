//! Dispatchgate - An HTTP connection dispatcher
//!
//! This library provides the dispatch layer between an HTTP transport and
//! application handlers:
//! - Creates one dispatch channel per endpoint and one link per connection
//! - Routes requests to virtual hosts by host/port aliases, honouring
//!   private headers from trusted proxies
//! - Runs handlers on classified executor pools and contains their failures
//! - Synthesizes 404/500/503 pages and a welcome page
//! - Tracks active connections for graceful quiesce and immediate stop
//! - Handles HTTP/2 streams and upgraded connections with exactly-once teardown

pub mod channel;
pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod host;
pub mod link;
pub mod message;
pub mod request;
pub mod response;
pub mod server;
pub mod settings;
pub mod tls;
pub mod vhost;

pub use channel::{ChainEventListener, ChannelConfig, ChannelState, DispatchChannel};
pub use connection::{
    ConnectionInfo, ConnectionMode, Transport, UpgradeSession, UpgradedConnection, UpgradedIo,
    VirtualConnection,
};
pub use error::DispatchError;
pub use factory::DispatchFactory;
pub use link::{DispatchLink, DispatchOutcome};
pub use request::HttpRequest;
pub use response::HttpResponse;
pub use settings::DispatcherSettings;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
