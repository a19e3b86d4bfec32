//! Naming and shutdown plumbing shared by the server adapters of one link.

use super::{Broker, Connection, EndpointHandle, Service, WeakBroker};
use crate::closer::Resource;
use crate::error::{Result, TetherError};
use crate::resource::ResourceId;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Connection-wide stop signal.
///
/// Flips once, when the broker starts shutting down.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the broker stops.
    ///
    /// Also returns if the broker was dropped without an explicit shutdown.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// A broker plus the hierarchical name of the adapter holding it.
///
/// Cheap to clone. Every server adapter that creates sub-resources holds one;
/// children get a copy with their own name appended.
///
/// The broker is held weakly: a context never keeps its connection alive.
/// Once every [`Broker`] handle is gone, its operations fail with
/// [`TetherError::ConnectionClosed`].
#[derive(Clone)]
pub struct BrokerExt {
    broker: WeakBroker,
    name: String,
    stop: StopSignal,
}

impl BrokerExt {
    pub fn new(broker: Broker, name: impl Into<String>) -> Self {
        Self {
            stop: broker.stop_signal(),
            broker: broker.downgrade(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> Result<Broker> {
        self.broker.upgrade()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Copy of this context named `"<self>.<child>"`.
    pub fn named(&self, child: &str) -> Self {
        Self {
            broker: self.broker.clone(),
            name: format!("{}.{}", self.name, child),
            stop: self.stop.clone(),
        }
    }

    /// Serve `service` as a child of this adapter, named `"<self>.<child>"`.
    pub fn serve_new(
        &self,
        child: &str,
        service: Arc<dyn Service>,
        deps: Vec<Resource>,
    ) -> Result<(ResourceId, EndpointHandle)> {
        if self.stop.is_stopped() {
            return Err(TetherError::ConnectionClosed);
        }
        let name = format!("{}.{}", self.name, child);
        let (id, handle) = self.broker.upgrade()?.serve_new(name.clone(), service, deps)?;
        debug!("{} spawned {} as resource {}", self.name, name, id);
        Ok((id, handle))
    }

    /// Dial a resource issued by the peer broker.
    pub async fn dial(&self, id: ResourceId) -> Result<Connection> {
        self.broker.upgrade()?.dial(id).await
    }
}

impl std::fmt::Debug for BrokerExt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerExt")
            .field("name", &self.name)
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Nop;

    #[async_trait]
    impl Service for Nop {
        async fn call(&self, _method: &str, _params: Value) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_named_appends_child() {
        let (_host, plugin) = Broker::pair("names");
        let ext = BrokerExt::new(plugin, "ReaderProvider");
        let child = ext.named("PriceGetter");
        assert_eq!(child.name(), "ReaderProvider.PriceGetter");
        assert_eq!(child.named("Cache").name(), "ReaderProvider.PriceGetter.Cache");
    }

    #[tokio::test]
    async fn test_serve_new_names_endpoint_hierarchically() {
        let (_host, plugin) = Broker::pair("serve");
        let ext = BrokerExt::new(plugin, "Parent");
        let (_id, handle) = ext.serve_new("Child", Arc::new(Nop), Vec::new()).unwrap();
        assert_eq!(handle.name(), "Parent.Child");
    }

    #[tokio::test]
    async fn test_serve_new_after_stop_fails() {
        let (_host, plugin) = Broker::pair("stopped");
        let ext = BrokerExt::new(plugin.clone(), "Parent");
        plugin.shutdown().await.unwrap();

        assert!(ext.stop_signal().is_stopped());
        let result = ext.serve_new("Child", Arc::new(Nop), Vec::new());
        assert!(matches!(result, Err(TetherError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_context_does_not_keep_broker_alive() {
        let (_host, plugin) = Broker::pair("weak");
        let ext = BrokerExt::new(plugin.clone(), "Parent");
        assert_eq!(ext.broker().unwrap().name(), "weak/plugin");

        drop(plugin);
        assert!(matches!(ext.broker(), Err(TetherError::ConnectionClosed)));
        assert!(matches!(
            ext.serve_new("Child", Arc::new(Nop), Vec::new()),
            Err(TetherError::ConnectionClosed)
        ));
    }
}
