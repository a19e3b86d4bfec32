//! Connection-scoped resource broker.
//!
//! A [`Broker`] is one side of a plugin link. It serves endpoints under IDs it
//! allocates ([`Broker::serve_new`]) and resolves IDs issued by the broker on
//! the other side of the link into connections ([`Broker::dial`]). Host and
//! plugin each own one broker; the pair shares nothing but the link.
//!
//! # Thread Safety
//!
//! `Broker` is a cheap `Clone` handle. The ID table is the only locked state;
//! everything else is owned by endpoint and link tasks and reached through
//! channels.

mod endpoint;
mod ext;

pub use endpoint::EndpointHandle;
pub use ext::{BrokerExt, StopSignal};

use crate::closer::{DependencyChain, Resource};
use crate::config::{BrokerConfig, LinkConfig};
use crate::error::{Result, TetherError};
use crate::resource::ResourceId;
use crate::transport::frame::{Code, Frame, Status};
use crate::transport::link::{Inbound, Link, Outbound};
use async_trait::async_trait;
use endpoint::{Endpoint, Incoming};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Method name of the teardown RPC every service accepts.
pub const CLOSE_METHOD: &str = "close";

/// A network-addressable service: what an endpoint dispatches to.
///
/// `close` must be idempotent: it runs when a `close` request arrives and
/// again when the endpoint itself stops.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
    async fn close(&self) -> Result<()>;
}

/// A live connection to one endpoint served by the peer broker.
#[derive(Clone)]
pub struct Connection {
    link: Arc<Link>,
    id: ResourceId,
}

impl Connection {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Invoke `method` on the endpoint.
    ///
    /// Suspends until the reply arrives; no timeout is applied.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        self.link.call(self.id, method, params).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("link", &self.link.name())
            .field("id", &self.id)
            .finish()
    }
}

struct Table {
    endpoints: HashMap<ResourceId, Arc<Endpoint>>,
    next_id: u32,
    shutting_down: bool,
}

/// The broker's ID table. Also receives inbound frames from the link.
pub(crate) struct Registry {
    name: String,
    config: BrokerConfig,
    outbound: Outbound,
    table: Mutex<Table>,
}

impl Registry {
    fn new(name: String, config: BrokerConfig, outbound: Outbound) -> Self {
        Self {
            name,
            config,
            outbound,
            table: Mutex::new(Table {
                endpoints: HashMap::new(),
                // Random base so two brokers rarely hand out the same IDs.
                next_id: rand::random::<u32>(),
                shutting_down: false,
            }),
        }
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|_| TetherError::Other(format!("broker {} table poisoned", self.name)))
    }

    /// For paths that only read or shrink the table. A retired ID must leave
    /// the table even after a panic elsewhere poisoned the lock.
    fn recover_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an ID (or take `fixed`) and start an endpoint under it.
    fn register(
        self: &Arc<Self>,
        fixed: Option<ResourceId>,
        name: String,
        service: Arc<dyn Service>,
        deps: DependencyChain,
    ) -> Result<Arc<Endpoint>> {
        let mut table = self.lock_table()?;

        if table.shutting_down {
            return Err(TetherError::ConnectionClosed);
        }
        if table.endpoints.len() >= self.config.max_endpoints {
            return Err(TetherError::AllocationFailed {
                name,
                message: format!("broker already serves {} endpoints", table.endpoints.len()),
            });
        }

        let id = match fixed {
            Some(id) if table.endpoints.contains_key(&id) => {
                return Err(TetherError::AllocationFailed {
                    name,
                    message: format!("resource {} is already served", id),
                });
            }
            Some(id) => id,
            None => Self::next_free_id(&mut table),
        };

        let endpoint = Endpoint::spawn(
            id,
            name,
            service,
            deps,
            Arc::downgrade(self),
            self.outbound.clone(),
            self.config.endpoint_queue_depth,
        );
        table.endpoints.insert(id, endpoint.clone());
        Ok(endpoint)
    }

    /// Never returns `ROOT` or an ID that is still live. The table is capped
    /// well below `u32::MAX`, so a free ID is always found.
    fn next_free_id(table: &mut Table) -> ResourceId {
        loop {
            let candidate = ResourceId::new(table.next_id);
            table.next_id = table.next_id.wrapping_add(1);
            if !candidate.is_root() && !table.endpoints.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn lookup(&self, id: ResourceId) -> Option<Arc<Endpoint>> {
        self.recover_table().endpoints.get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: ResourceId) {
        self.recover_table().endpoints.remove(&id);
    }

    fn live_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.recover_table().endpoints.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Refuse new endpoints and hand back every live one.
    fn begin_shutdown(&self) -> Vec<Arc<Endpoint>> {
        let mut table = self.recover_table();
        table.shutting_down = true;
        table.endpoints.values().cloned().collect()
    }

    async fn reply(&self, frame: Frame) {
        if let Err(e) = self.outbound.send(&frame).await {
            debug!("Broker {} dropped reply: {}", self.name, e);
        }
    }
}

#[async_trait]
impl Inbound for Registry {
    async fn on_call(&self, seq: u64, endpoint: ResourceId, method: String, params: Value) {
        let delivered = match self.lookup(endpoint) {
            Some(target) => target.deliver(Incoming { seq, method, params }).await,
            None => false,
        };
        if !delivered {
            debug!(
                "Broker {} rejected call to resource {}: not serving",
                self.name, endpoint
            );
            self.reply(Frame::failure(seq, Status::unavailable(endpoint)))
                .await;
        }
    }

    async fn on_resolve(&self, seq: u64, endpoint: ResourceId) {
        let frame = if self.lookup(endpoint).is_some() {
            Frame::success(seq, Value::Null)
        } else {
            Frame::failure(
                seq,
                Status::new(Code::NotFound, format!("resource {} not found", endpoint)),
            )
        };
        self.reply(frame).await;
    }
}

struct BrokerInner {
    name: String,
    registry: Arc<Registry>,
    link: Arc<Link>,
    stop: watch::Sender<bool>,
    done: watch::Sender<bool>,
    shutdown_started: AtomicBool,
}

/// One side of a plugin connection.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

/// Broker handle that does not keep the broker alive.
///
/// Held by everything an endpoint task owns, so that dropping the last
/// [`Broker`] still releases the link and its endpoints.
#[derive(Clone)]
pub(crate) struct WeakBroker {
    inner: Weak<BrokerInner>,
}

impl WeakBroker {
    pub(crate) fn upgrade(&self) -> Result<Broker> {
        self.inner
            .upgrade()
            .map(|inner| Broker { inner })
            .ok_or(TetherError::ConnectionClosed)
    }
}

impl Broker {
    /// Start a broker over `io` with default settings.
    pub fn new<T>(name: impl Into<String>, io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(name, io, BrokerConfig::default())
    }

    /// Start a broker over `io`.
    ///
    /// Must be called inside a tokio runtime: the link and endpoint tasks are
    /// spawned on it.
    pub fn with_config<T>(name: impl Into<String>, io: T, config: BrokerConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (outbound, outbound_rx) =
            Outbound::channel(config.outbound_queue_depth, config.max_frame_size);
        let registry = Arc::new(Registry::new(name.clone(), config, outbound.clone()));
        let link = Link::start(name.clone(), io, outbound, outbound_rx, registry.clone());
        let (stop, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        let inner = Arc::new(BrokerInner {
            name,
            registry,
            link,
            stop,
            done,
            shutdown_started: AtomicBool::new(false),
        });
        Self::supervise(&inner);

        debug!("Broker {} started", inner.name);
        Self { inner }
    }

    /// Shut the broker down once its link drops or its stop signal fires.
    fn supervise(inner: &Arc<BrokerInner>) {
        let weak: Weak<BrokerInner> = Arc::downgrade(inner);
        let mut link_closed = inner.link.closed_signal();
        let mut stopped = inner.stop.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = link_closed.wait_for(|closed| *closed) => {}
                _ = stopped.wait_for(|stopped| *stopped) => {}
            }
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = (Broker { inner }).shutdown().await {
                    warn!("Broker shutdown reported errors: {}", e);
                }
            }
        });
    }

    /// Two brokers joined by an in-memory link, for in-process plugins.
    ///
    /// Returns `(host, plugin)`.
    pub fn pair(name: &str) -> (Broker, Broker) {
        let (host_io, plugin_io) = tokio::io::duplex(LinkConfig::DUPLEX_BUFFER_SIZE);
        (
            Broker::new(format!("{}/host", name), host_io),
            Broker::new(format!("{}/plugin", name), plugin_io),
        )
    }

    /// Connect to a plugin listening on `addr`.
    pub async fn connect(name: impl Into<String>, addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(LinkConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TetherError::Timeout(LinkConfig::CONNECT_TIMEOUT))??;
        stream.set_nodelay(true)?;

        let broker = Self::new(name, stream);
        info!("Broker {} connected to {}", broker.name(), addr);
        Ok(broker)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn downgrade(&self) -> WeakBroker {
        WeakBroker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether shutdown has begun, by request or because the link dropped.
    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow() || self.inner.link.is_closed()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(TetherError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Wait until shutdown has finished tearing every endpoint down.
    pub async fn closed(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Signal observed by long-running work tied to this connection.
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal::new(self.inner.stop.subscribe())
    }

    /// Start serving `service` under a freshly allocated ID.
    ///
    /// `deps` are closed, in order, after the endpoint stops. The returned
    /// handle stops the endpoint.
    pub fn serve_new(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
        deps: Vec<Resource>,
    ) -> Result<(ResourceId, EndpointHandle)> {
        self.ensure_running()?;
        let name = name.into();
        let endpoint = self.inner.registry.register(
            None,
            name.clone(),
            service,
            DependencyChain::from_resources(deps),
        )?;
        debug!(
            "Broker {} serving {} as resource {}",
            self.inner.name,
            name,
            endpoint.id()
        );
        Ok((endpoint.id(), EndpointHandle::new(endpoint)))
    }

    /// Serve the root service of this link at [`ResourceId::ROOT`].
    pub fn serve_root(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> Result<EndpointHandle> {
        self.ensure_running()?;
        let name = name.into();
        let endpoint = self.inner.registry.register(
            Some(ResourceId::ROOT),
            name.clone(),
            service,
            DependencyChain::new(),
        )?;
        info!("Broker {} serving root {}", self.inner.name, name);
        Ok(EndpointHandle::new(endpoint))
    }

    /// Resolve an ID issued by the peer broker into a connection.
    ///
    /// Fails with [`TetherError::ResourceNotFound`] if the peer is not serving
    /// `id`, including when `id` came from some other broker.
    pub async fn dial(&self, id: ResourceId) -> Result<Connection> {
        self.ensure_running()?;
        self.inner.link.resolve(id).await?;
        debug!("Broker {} dialed resource {}", self.inner.name, id);
        Ok(Connection {
            link: self.inner.link.clone(),
            id,
        })
    }

    /// Dial the peer's root service.
    pub async fn dial_root(&self) -> Result<Connection> {
        self.dial(ResourceId::ROOT).await
    }

    /// IDs of the endpoints this broker currently serves, ascending.
    pub fn live_resources(&self) -> Vec<ResourceId> {
        self.inner.registry.live_ids()
    }

    /// Stop every endpoint, then close the link.
    ///
    /// Endpoints without a parent (the root and plain `serve_new` endpoints)
    /// are stopped first. Each of them closes its own children through its
    /// dependency chain, in spawn order and after the parent's implementation.
    /// Any endpoint a chain did not reach is stopped last.
    ///
    /// Idempotent; only the first call waits for teardown and reports its
    /// errors. Calls through any connection of this broker fail with
    /// [`TetherError::ConnectionClosed`] afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Broker {} shutting down", self.inner.name);
        self.inner.stop.send_replace(true);

        let (children, parentless): (Vec<_>, Vec<_>) = self
            .inner
            .registry
            .begin_shutdown()
            .into_iter()
            .partition(|ep| ep.has_parent());
        let mut results =
            futures::future::join_all(parentless.iter().map(|ep| ep.stop())).await;
        // Already stopped by their parents' chains unless a chain was cut short.
        results.extend(futures::future::join_all(children.iter().map(|ep| ep.stop())).await);

        // Endpoint replies were queued first, so they are flushed before goodbye.
        self.inner.link.close().await;

        self.inner.done.send_replace(true);

        let errors: Vec<TetherError> = results.into_iter().filter_map(|r| r.err()).collect();
        if errors.is_empty() {
            info!("Broker {} stopped", self.inner.name);
            Ok(())
        } else {
            Err(TetherError::Aggregate(errors))
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.inner.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
