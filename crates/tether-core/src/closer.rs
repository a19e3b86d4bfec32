//! Closers and the dependency-closing chain.
//!
//! Every server adapter owns a [`DependencyChain`]: the wrapped
//! implementation first, then the endpoint of every resource it spawned, in
//! spawn order. Closing the chain closes every entry exactly once, keeps going
//! past failures, and reports all failures together.

use crate::error::{Result, TetherError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Something that owns resources and can release them.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<T: Closer + ?Sized> Closer for Arc<T> {
    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// A named entry in a dependency chain.
pub struct Resource {
    name: String,
    closer: Arc<dyn Closer>,
}

impl Resource {
    pub fn new(name: impl Into<String>, closer: Arc<dyn Closer>) -> Self {
        Self {
            name: name.into(),
            closer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<()> {
        self.closer.close().await
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource").field("name", &self.name).finish()
    }
}

#[derive(Default)]
struct ChainState {
    entries: Vec<Resource>,
    closed: bool,
}

/// Ordered, appendable list of resources closed together.
#[derive(Default)]
pub struct DependencyChain {
    state: Mutex<ChainState>,
}

impl DependencyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from resources in the order they should close.
    pub fn from_resources(resources: Vec<Resource>) -> Self {
        Self {
            state: Mutex::new(ChainState {
                entries: resources,
                closed: false,
            }),
        }
    }

    /// Append a resource.
    ///
    /// A chain that has already been closed cannot hold new entries, so the
    /// resource is closed on the spot and its error returned.
    pub async fn push(&self, resource: Resource) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            debug!("Chain already closed, closing late resource {}", resource.name);
            return resource.close().await;
        }
        state.entries.push(resource);
        Ok(())
    }

    /// Number of resources still waiting to be closed.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Close every resource in order.
    ///
    /// Never stops at the first failure. Returns `Ok` when every entry closed
    /// cleanly, otherwise [`TetherError::Aggregate`] with one error per failed
    /// entry. A second call is a no-op.
    pub async fn close(&self) -> Result<()> {
        let entries = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.entries)
        };

        let mut errors = Vec::new();
        for resource in entries {
            if let Err(e) = resource.close().await {
                warn!("Failed to close {}: {}", resource.name, e);
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TetherError::Aggregate(errors))
        }
    }
}

#[async_trait]
impl Closer for DependencyChain {
    async fn close(&self) -> Result<()> {
        DependencyChain::close(self).await
    }
}
