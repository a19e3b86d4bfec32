//! Generic client/server adapter pair.
//!
//! A capability is one typed interface exposed across the link. It is
//! instantiated by writing:
//!
//! - a [`Dispatch`] table that routes method names to the implementation and
//!   hands created sub-services to the [`Spawner`],
//! - a typed client that wraps a [`CapabilityClient`].
//!
//! The adapters carry everything else: endpoint registration, the dependency
//! chain, idempotent close and close-race tolerance.

mod client;
mod server;

pub use client::CapabilityClient;
pub use server::{CapabilityServer, Spawner};

use crate::error::{Result, TetherError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Method routing for one capability.
///
/// `close` is never dispatched; the server adapter routes it to
/// [`Dispatch::close`] through its dependency chain.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Capability name, used for endpoint names and error messages.
    fn capability(&self) -> &'static str;

    async fn dispatch(&self, method: &str, params: Value, spawner: &Spawner) -> Result<Value>;

    /// Release the wrapped implementation.
    async fn close(&self) -> Result<()>;
}

/// Decode method params.
pub fn params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| TetherError::InvalidParams {
        method: method.to_string(),
        message: e.to_string(),
    })
}

/// Encode a method result.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Error for a method the capability does not have.
pub fn method_not_found(capability: &str, method: &str) -> TetherError {
    TetherError::MethodNotFound {
        capability: capability.to_string(),
        method: method.to_string(),
    }
}
