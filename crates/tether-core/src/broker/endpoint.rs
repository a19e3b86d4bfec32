//! Endpoint tasks.
//!
//! Each endpoint registered on a broker runs its own task that reads from its
//! request queue and handles every request on a task of its own, so calls on
//! one resource may run concurrently. The endpoint lives until one of:
//!
//! - a `close` request completes (the resource closed itself),
//! - its [`EndpointHandle`] is closed (the parent tears it down),
//! - the broker shuts down.
//!
//! On the way out the endpoint leaves the broker table first, answers every
//! unfinished request with `unavailable`, then closes the service and the
//! dependencies it was registered with. A `close` request closes both before
//! it is acknowledged, and its reply carries their errors.

use super::{Registry, Service, CLOSE_METHOD};
use crate::closer::{Closer, DependencyChain, Resource};
use crate::error::{Result, TetherError};
use crate::resource::ResourceId;
use crate::transport::frame::{Code, Status};
use crate::transport::link::Outbound;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// A request waiting in an endpoint's queue.
pub(crate) struct Incoming {
    pub seq: u64,
    pub method: String,
    pub params: Value,
}

/// Outcome of one handled request.
struct Handled {
    seq: u64,
    is_close: bool,
    outcome: std::result::Result<Value, Status>,
}

pub(crate) struct Endpoint {
    id: ResourceId,
    name: String,
    requests: mpsc::Sender<Incoming>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
    /// Set once the endpoint sits in another resource's dependency chain.
    has_parent: AtomicBool,
}

impl Endpoint {
    pub(crate) fn spawn(
        id: ResourceId,
        name: String,
        service: Arc<dyn Service>,
        deps: DependencyChain,
        registry: Weak<Registry>,
        outbound: Outbound,
        queue_depth: usize,
    ) -> Arc<Self> {
        let (requests, requests_rx) = mpsc::channel(queue_depth);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let ctx = ServeContext {
            id,
            name: name.clone(),
            registry,
            outbound,
        };
        let task = tokio::spawn(serve(ctx, service, deps, requests_rx, shutdown_rx));

        debug!("Endpoint {} ({}) serving", name, id);

        Arc::new(Self {
            id,
            name,
            requests,
            shutdown,
            task: Mutex::new(Some(task)),
            has_parent: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Whether a parent closes this endpoint. Broker shutdown leaves such
    /// endpoints to their parent.
    pub(crate) fn has_parent(&self) -> bool {
        self.has_parent.load(Ordering::SeqCst)
    }

    /// Queue a request. Returns `false` if the endpoint stopped accepting.
    pub(crate) async fn deliver(&self, incoming: Incoming) -> bool {
        self.requests.send(incoming).await.is_ok()
    }

    /// Stop the endpoint and wait for its teardown.
    ///
    /// Only the first caller observes the teardown result; later calls return
    /// `Ok` immediately.
    pub(crate) async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let task = self.task.lock().await.take();
        match task {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(TetherError::Other(format!(
                    "endpoint {} ({}) task failed: {}",
                    self.name, self.id, e
                ))),
            },
            None => Ok(()),
        }
    }
}

/// Handle to an endpoint started by `serve_new`.
///
/// Closing it stops the endpoint, which makes its ID undialable, and closes
/// the served resource and every dependency registered with it.
#[derive(Clone)]
pub struct EndpointHandle {
    endpoint: Arc<Endpoint>,
}

impl EndpointHandle {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }

    pub fn id(&self) -> ResourceId {
        self.endpoint.id()
    }

    pub fn name(&self) -> &str {
        self.endpoint.name()
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

#[async_trait]
impl Closer for EndpointHandle {
    async fn close(&self) -> Result<()> {
        self.endpoint.stop().await
    }
}

/// Hands the endpoint to whichever dependency chain takes the resource.
impl From<EndpointHandle> for Resource {
    fn from(handle: EndpointHandle) -> Self {
        handle.endpoint.has_parent.store(true, Ordering::SeqCst);
        Resource::new(handle.name().to_string(), Arc::new(handle))
    }
}

struct ServeContext {
    id: ResourceId,
    name: String,
    registry: Weak<Registry>,
    outbound: Outbound,
}

impl ServeContext {
    /// Leave the broker table. From here on the ID no longer resolves.
    fn retire(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    async fn reply(&self, seq: u64, outcome: std::result::Result<Value, Status>) {
        if let Err(e) = self.outbound.reply(seq, outcome).await {
            debug!(
                "Endpoint {} ({}) dropped reply {}: {}",
                self.name, self.id, seq, e
            );
        }
    }
}

/// Close the service, then its registered dependencies.
async fn close_all(service: &dyn Service, deps: &DependencyChain) -> Result<()> {
    let mut errors = Vec::new();
    collect_errors(&mut errors, service.close().await);
    collect_errors(&mut errors, deps.close().await);
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(TetherError::Aggregate(errors)),
    }
}

async fn handle(
    service: Arc<dyn Service>,
    deps: Arc<DependencyChain>,
    incoming: Incoming,
) -> Handled {
    let Incoming {
        seq,
        method,
        params,
    } = incoming;
    let is_close = method == CLOSE_METHOD;
    let work = {
        let method = method.clone();
        async move {
            if is_close {
                close_all(service.as_ref(), &deps).await.map(|()| Value::Null)
            } else {
                service.call(&method, params).await
            }
        }
    };

    let outcome = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result.map_err(|e| e.to_status()),
        Err(_) => Err(Status::new(
            Code::Internal,
            format!("handler for {} panicked", method),
        )),
    };

    Handled {
        seq,
        is_close,
        outcome,
    }
}

/// Collect a close result, flattening aggregates.
fn collect_errors(errors: &mut Vec<TetherError>, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(TetherError::Aggregate(nested)) => errors.extend(nested),
        Err(e) => errors.push(e),
    }
}

async fn serve(
    ctx: ServeContext,
    service: Arc<dyn Service>,
    deps: DependencyChain,
    mut requests: mpsc::Receiver<Incoming>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let deps = Arc::new(deps);
    let mut in_flight: JoinSet<Handled> = JoinSet::new();
    let mut waiting: HashSet<u64> = HashSet::new();
    // Ordinary calls only. A close handler always runs to completion so a
    // half-closed dependency chain is never abandoned.
    let mut abortable: HashMap<u64, AbortHandle> = HashMap::new();

    loop {
        tokio::select! {
            // Fires on stop, or when the endpoint handle is dropped with the broker.
            _ = shutdown.changed() => break,
            incoming = requests.recv() => {
                let Some(incoming) = incoming else { break };
                let seq = incoming.seq;
                let is_close = incoming.method == CLOSE_METHOD;
                waiting.insert(seq);
                let task = in_flight.spawn(handle(service.clone(), deps.clone(), incoming));
                if !is_close {
                    abortable.insert(seq, task);
                }
            }
            Some(joined) = in_flight.join_next() => {
                let Ok(handled) = joined else { continue };
                waiting.remove(&handled.seq);
                abortable.remove(&handled.seq);
                if handled.is_close {
                    // Dependencies are already closed. Leave the table before
                    // acknowledging.
                    ctx.retire();
                    ctx.reply(handled.seq, handled.outcome).await;
                    break;
                }
                ctx.reply(handled.seq, handled.outcome).await;
            }
        }
    }

    ctx.retire();

    requests.close();
    while let Ok(incoming) = requests.try_recv() {
        ctx.reply(incoming.seq, Err(Status::unavailable(ctx.id))).await;
    }

    for (_, task) in abortable.drain() {
        task.abort();
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Ok(handled) = joined {
            waiting.remove(&handled.seq);
            ctx.reply(handled.seq, handled.outcome).await;
        }
    }
    for seq in waiting {
        ctx.reply(seq, Err(Status::unavailable(ctx.id))).await;
    }

    let mut errors = Vec::new();
    let closed = service.close().await;
    if let Err(e) = &closed {
        warn!("Endpoint {} ({}) failed to close: {}", ctx.name, ctx.id, e);
    }
    collect_errors(&mut errors, closed);
    collect_errors(&mut errors, deps.close().await);

    info!("Endpoint {} ({}) stopped", ctx.name, ctx.id);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TetherError::Aggregate(errors))
    }
}
