//! Server adapter.

use super::{to_value, Dispatch};
use crate::broker::{BrokerExt, Service};
use crate::closer::{Closer, DependencyChain, Resource};
use crate::error::{Result, TetherError};
use crate::resource::ResourceReply;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Closes the wrapped implementation as the first chain entry.
struct ImplCloser<D: Dispatch>(Arc<D>);

#[async_trait]
impl<D: Dispatch> Closer for ImplCloser<D> {
    async fn close(&self) -> Result<()> {
        self.0.close().await
    }
}

/// Registers sub-services created by a dispatched method.
pub struct Spawner {
    capability: &'static str,
    ext: Option<BrokerExt>,
    deps: Arc<DependencyChain>,
}

impl Spawner {
    /// Serve `child` as a new endpoint and return its resource reply.
    ///
    /// The child's endpoint is appended to the parent's dependency chain, so
    /// closing the parent closes the child.
    pub async fn spawn<C: Dispatch>(&self, child: C) -> Result<Value> {
        let ext = self.ext.as_ref().ok_or_else(|| TetherError::NoBroker {
            capability: self.capability.to_string(),
        })?;

        let child_name = child.capability();
        let server = CapabilityServer::new(child, Some(ext.named(child_name)));
        let (id, handle) = ext.serve_new(child_name, Arc::new(server), Vec::new())?;

        if self.deps.is_closed().await {
            // Parent closed while the child was being created.
            handle.close().await?;
            return Err(TetherError::ResourceClosed {
                name: self.capability.to_string(),
            });
        }
        self.deps.push(Resource::from(handle)).await?;

        to_value(&ResourceReply { resource_id: id })
    }
}

/// Wraps a [`Dispatch`] table as a broker [`Service`].
///
/// The dependency chain starts with the implementation itself, followed by
/// every child endpoint in spawn order. Close runs the chain once; a second
/// close is a no-op.
pub struct CapabilityServer<D: Dispatch> {
    inner: Arc<D>,
    spawner: Spawner,
    deps: Arc<DependencyChain>,
    closed: AtomicBool,
}

impl<D: Dispatch> CapabilityServer<D> {
    /// `ext` is only needed if the capability creates sub-resources.
    pub fn new(inner: D, ext: Option<BrokerExt>) -> Self {
        let inner = Arc::new(inner);
        let capability = inner.capability();
        let deps = Arc::new(DependencyChain::from_resources(vec![Resource::new(
            capability,
            Arc::new(ImplCloser(inner.clone())),
        )]));

        Self {
            spawner: Spawner {
                capability,
                ext,
                deps: deps.clone(),
            },
            inner,
            deps,
            closed: AtomicBool::new(false),
        }
    }

    pub fn capability(&self) -> &'static str {
        self.inner.capability()
    }

    /// Entries still waiting to be closed, implementation included.
    pub async fn dependency_count(&self) -> usize {
        self.deps.len().await
    }
}

#[async_trait]
impl<D: Dispatch> Service for CapabilityServer<D> {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TetherError::ResourceClosed {
                name: self.capability().to_string(),
            });
        }
        self.inner.dispatch(method, params, &self.spawner).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing {}", self.capability());
        self.deps.close().await
    }
}
