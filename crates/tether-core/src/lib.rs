//! Tether Core - resource broker and RPC proxying for out-of-process plugins.
//!
//! A host drives business logic living in a separate plugin process through
//! ordinary typed traits. Each side of the link owns a [`Broker`]; services are
//! served under connection-scoped [`ResourceId`]s, methods that create further
//! services hand back only an ID, and the other side dials that ID to get a
//! live connection. Closing a root service tears its whole subtree down.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::capabilities::{PriceGetterConfig, ReaderProvider, ReaderProviderClient};
//! use tether_core::PluginProcess;
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let plugin = PluginProcess::launch(
//!         "reader",
//!         tokio::process::Command::new("tether-plugin"),
//!     )
//!     .await?;
//!
//!     let provider = ReaderProviderClient::dial_root(plugin.broker()).await?;
//!     let prices = provider.new_price_getter(PriceGetterConfig::default()).await?;
//!     println!("LINK supported: {}", prices.is_token_supported("LINK").await?);
//!
//!     provider.close().await?;
//!     plugin.shutdown().await
//! }
//! ```

pub mod broker;
pub mod capabilities;
pub mod capability;
pub mod closer;
pub mod config;
pub mod error;
pub mod plugin;
pub mod resource;
pub mod transport;

// Re-export commonly used types
pub use broker::{Broker, BrokerExt, Connection, EndpointHandle, Service, StopSignal, CLOSE_METHOD};
pub use capability::{CapabilityClient, CapabilityServer, Dispatch, Spawner};
pub use closer::{Closer, DependencyChain, Resource};
pub use config::{BrokerConfig, LinkConfig};
pub use error::{Result, TetherError};
pub use plugin::{PluginListener, PluginProcess};
pub use resource::{ResourceId, ResourceReply};
pub use transport::{Code, Status};
