//! Protocol tests for the broker and the capability adapters.
//!
//! Every test runs both sides of a link in-process over `Broker::pair`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::capability::method_not_found;
use tether_core::{
    Broker, BrokerConfig, BrokerExt, CapabilityClient, CapabilityServer, Closer, Code, Dispatch,
    LinkConfig, Resource, ResourceId, Result, Service, Spawner, TetherError,
};

type CloseLog = Arc<Mutex<Vec<String>>>;

#[derive(Serialize, Deserialize)]
struct SpawnParams {
    label: String,
    #[serde(default)]
    fail_close: bool,
    #[serde(default)]
    close_delay_ms: u64,
}

/// Test capability: reports its label, spawns children, logs closes.
struct Node {
    label: String,
    fail_close: bool,
    close_delay: Duration,
    log: CloseLog,
}

impl Node {
    fn new(label: &str, log: &CloseLog) -> Self {
        Self {
            label: label.to_string(),
            fail_close: false,
            close_delay: Duration::ZERO,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl Dispatch for Node {
    fn capability(&self) -> &'static str {
        "Node"
    }

    async fn dispatch(&self, method: &str, params: Value, spawner: &Spawner) -> Result<Value> {
        match method {
            "label" => Ok(Value::from(self.label.clone())),
            "spawn" => {
                let p: SpawnParams = tether_core::capability::params(method, params)?;
                spawner
                    .spawn(Node {
                        label: p.label,
                        fail_close: p.fail_close,
                        close_delay: Duration::from_millis(p.close_delay_ms),
                        log: self.log.clone(),
                    })
                    .await
            }
            "hang" => std::future::pending::<Result<Value>>().await,
            _ => Err(method_not_found("Node", method)),
        }
    }

    async fn close(&self) -> Result<()> {
        tokio::time::sleep(self.close_delay).await;
        self.log.lock().unwrap().push(self.label.clone());
        if self.fail_close {
            Err(TetherError::Other(format!("{} refused to close", self.label)))
        } else {
            Ok(())
        }
    }
}

struct Fixture {
    host: Broker,
    plugin: Broker,
    root: CapabilityClient,
    log: CloseLog,
}

impl Fixture {
    async fn new(name: &str) -> Self {
        Self::with_root_close_delay(name, Duration::ZERO).await
    }

    async fn with_root_close_delay(name: &str, close_delay: Duration) -> Self {
        let (host, plugin) = Broker::pair(name);
        let log: CloseLog = Arc::default();
        let root = Node {
            close_delay,
            ..Node::new("root", &log)
        };
        let server = CapabilityServer::new(root, Some(BrokerExt::new(plugin.clone(), "Node")));
        plugin.serve_root("Node", Arc::new(server)).unwrap();

        let conn = host.dial_root().await.unwrap();
        let root = CapabilityClient::new("Node", conn, Some(BrokerExt::new(host.clone(), "Node")));
        Self {
            host,
            plugin,
            root,
            log,
        }
    }

    async fn spawn(&self, label: &str, fail_close: bool) -> CapabilityClient {
        self.spawn_with(SpawnParams {
            label: label.to_string(),
            fail_close,
            close_delay_ms: 0,
        })
        .await
    }

    async fn spawn_with(&self, params: SpawnParams) -> CapabilityClient {
        self.root
            .call_resource("spawn", &params, "Node")
            .await
            .unwrap()
    }

    fn closed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

async fn label(client: &CapabilityClient) -> Result<String> {
    client.call("label", &Value::Null).await
}

#[tokio::test]
async fn test_ids_are_distinct_while_live() {
    let fx = Fixture::new("distinct").await;
    let mut seen = HashSet::new();
    for i in 0..50 {
        let child = fx.spawn(&format!("child-{}", i), false).await;
        assert!(!child.id().is_root());
        assert!(seen.insert(child.id()), "duplicate id {}", child.id());
    }
    // Root plus every child.
    assert_eq!(fx.plugin.live_resources().len(), 51);
}

#[tokio::test]
async fn test_dial_reaches_exact_endpoint() {
    let fx = Fixture::new("exact").await;
    let a = fx.spawn("a", false).await;
    let b = fx.spawn("b", false).await;

    assert_eq!(label(&a).await.unwrap(), "a");
    assert_eq!(label(&b).await.unwrap(), "b");

    let again = fx.host.dial(b.id()).await.unwrap();
    assert_eq!(again.id(), b.id());
    assert_eq!(again.invoke("label", Value::Null).await.unwrap(), json!("b"));
}

#[tokio::test]
async fn test_dial_foreign_id_fails() {
    let fx = Fixture::new("issuer").await;
    let child = fx.spawn("child", false).await;

    let (other_host, _other_plugin) = Broker::pair("other");
    let err = other_host.dial(child.id()).await.unwrap_err();
    assert!(matches!(err, TetherError::ResourceNotFound { id } if id == child.id()));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_dial_own_id_fails() {
    // IDs are only dialable from the paired side.
    let fx = Fixture::new("own").await;
    let child = fx.spawn("child", false).await;
    let err = fx.plugin.dial(child.id()).await.unwrap_err();
    assert!(matches!(err, TetherError::ResourceNotFound { .. }));
}

#[tokio::test]
async fn test_close_after_server_teardown_succeeds() {
    let fx = Fixture::new("torn").await;
    let child = fx.spawn("child", false).await;

    fx.root.close().await.unwrap();

    child.close().await.unwrap();
    fx.root.close().await.unwrap();
    assert_eq!(fx.closed(), vec!["root", "child"]);
}

#[tokio::test]
async fn test_closed_id_is_undialable() {
    let fx = Fixture::new("undialable").await;
    let child = fx.spawn("child", false).await;
    let id = child.id();

    child.close().await.unwrap();

    let err = fx.host.dial(id).await.unwrap_err();
    assert!(matches!(err, TetherError::ResourceNotFound { .. }));
    assert_eq!(fx.closed(), vec!["child"]);
    assert_eq!(fx.plugin.live_resources(), vec![ResourceId::ROOT]);
}

#[tokio::test]
async fn test_scenario_child_lifecycle() {
    let fx = Fixture::new("lifecycle").await;
    let child = fx.spawn("child", false).await;
    assert_eq!(label(&child).await.unwrap(), "child");

    fx.root.close().await.unwrap();

    let err = fx.host.dial(child.id()).await.unwrap_err();
    assert!(matches!(err, TetherError::ResourceNotFound { .. }));
    assert!(fx.plugin.live_resources().is_empty());
}

#[tokio::test]
async fn test_scenario_children_close_in_spawn_order() {
    let fx = Fixture::new("order").await;
    let _first = fx.spawn("first", true).await;
    let _second = fx.spawn("second", false).await;

    let err = fx.root.close().await.unwrap_err();
    match err {
        TetherError::Remote { code, message } => {
            assert_eq!(code, Code::Unknown);
            assert!(message.contains("first refused to close"));
        }
        other => panic!("Expected Remote, got: {:?}", other),
    }

    assert_eq!(fx.closed(), vec!["root", "first", "second"]);
    assert!(fx.plugin.live_resources().is_empty());
}

#[tokio::test]
async fn test_nested_children_close_depth_first() {
    let fx = Fixture::new("nested").await;
    let parent = fx.spawn("parent", false).await;
    let _grandchild = parent
        .call_resource(
            "spawn",
            &SpawnParams {
                label: "grandchild".to_string(),
                fail_close: false,
                close_delay_ms: 0,
            },
            "Node",
        )
        .await
        .unwrap();
    let _sibling = fx.spawn("sibling", false).await;

    fx.root.close().await.unwrap();

    assert_eq!(fx.closed(), vec!["root", "parent", "grandchild", "sibling"]);
}

/// Service whose close reports a fixed error.
struct RacingClose {
    error: fn() -> TetherError,
}

#[async_trait]
impl Service for RacingClose {
    async fn call(&self, _method: &str, _params: Value) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn close(&self) -> Result<()> {
        Err((self.error)())
    }
}

async fn close_with(error: fn() -> TetherError) -> Result<()> {
    let (host, plugin) = Broker::pair("race");
    let (id, _handle) = plugin
        .serve_new("Racing", Arc::new(RacingClose { error }), Vec::new())
        .unwrap();
    let conn = host.dial(id).await.unwrap();
    CapabilityClient::new("Racing", conn, None).close().await
}

#[tokio::test]
async fn test_scenario_unavailable_close_is_success() {
    let result = close_with(|| TetherError::ResourceClosed {
        name: "Racing".to_string(),
    })
    .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_internal_close_is_success() {
    let result = close_with(|| TetherError::Protocol {
        message: "reply lost".to_string(),
    })
    .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_other_close_errors_surface() {
    let result = close_with(|| TetherError::Other("disk full".to_string())).await;
    assert!(matches!(
        result,
        Err(TetherError::Remote {
            code: Code::Unknown,
            ..
        })
    ));
}

#[tokio::test]
async fn test_close_on_stopped_endpoint_is_success() {
    let (host, plugin) = Broker::pair("stopped");
    let log: CloseLog = Arc::default();
    let node = Node::new("lone", &log);
    let (id, handle) = plugin
        .serve_new("Node", Arc::new(CapabilityServer::new(node, None)), Vec::new())
        .unwrap();
    let client = CapabilityClient::new("Node", host.dial(id).await.unwrap(), None);

    handle.close().await.unwrap();

    client.close().await.unwrap();
    assert_eq!(log.lock().unwrap().clone(), vec!["lone"]);
}

struct LogCloser {
    label: String,
    delay: Duration,
    fail: bool,
    log: CloseLog,
}

impl LogCloser {
    fn resource(label: &str, log: &CloseLog) -> Resource {
        Self::resource_with(label, Duration::ZERO, false, log)
    }

    fn resource_with(label: &str, delay: Duration, fail: bool, log: &CloseLog) -> Resource {
        Resource::new(
            label,
            Arc::new(LogCloser {
                label: label.to_string(),
                delay,
                fail,
                log: log.clone(),
            }),
        )
    }
}

#[async_trait]
impl Closer for LogCloser {
    async fn close(&self) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(self.label.clone());
        if self.fail {
            Err(TetherError::Other(format!("{} failed to flush", self.label)))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_serve_new_closes_registered_dependencies() {
    let (_host, plugin) = Broker::pair("deps");
    let log: CloseLog = Arc::default();
    let (_id, handle) = plugin
        .serve_new(
            "Node",
            Arc::new(CapabilityServer::new(Node::new("owner", &log), None)),
            vec![
                LogCloser::resource("db", &log),
                LogCloser::resource("cache", &log),
            ],
        )
        .unwrap();

    handle.close().await.unwrap();
    assert_eq!(log.lock().unwrap().clone(), vec!["owner", "db", "cache"]);
}

#[tokio::test]
async fn test_client_close_reports_dependency_failure() {
    let (host, plugin) = Broker::pair("dep-failure");
    let log: CloseLog = Arc::default();
    let (id, _handle) = plugin
        .serve_new(
            "Node",
            Arc::new(CapabilityServer::new(Node::new("owner", &log), None)),
            vec![
                LogCloser::resource_with("db", Duration::from_millis(100), true, &log),
                LogCloser::resource("cache", &log),
            ],
        )
        .unwrap();
    let client = CapabilityClient::new("Node", host.dial(id).await.unwrap(), None);

    let err = client.close().await.unwrap_err();
    match err {
        TetherError::Remote { code, message } => {
            assert_eq!(code, Code::Unknown);
            assert!(message.contains("db failed to flush"));
        }
        other => panic!("Expected Remote, got: {:?}", other),
    }
    // Every dependency was closed before the reply went out.
    assert_eq!(log.lock().unwrap().clone(), vec!["owner", "db", "cache"]);
    assert!(matches!(
        host.dial(id).await,
        Err(TetherError::ResourceNotFound { .. })
    ));
}

#[tokio::test]
async fn test_abandoned_call_leaves_resource_live() {
    let fx = Fixture::new("abandon").await;
    let child = fx.spawn("child", false).await;

    let hung = tokio::time::timeout(
        Duration::from_millis(50),
        child.call::<_, Value>("hang", &Value::Null),
    )
    .await;
    assert!(hung.is_err());

    assert_eq!(label(&child).await.unwrap(), "child");
    assert!(fx.closed().is_empty());
}

#[tokio::test]
async fn test_calls_on_one_resource_run_concurrently() {
    let fx = Fixture::new("concurrent").await;
    let child = fx.spawn("child", false).await;

    let hanging = {
        let child = child.clone();
        tokio::spawn(async move { child.call::<_, Value>("hang", &Value::Null).await })
    };
    // A hung call does not block the next one.
    let reply = tokio::time::timeout(Duration::from_secs(5), label(&child)).await;
    assert_eq!(reply.unwrap().unwrap(), "child");

    // Stopping the endpoint answers the hung call.
    child.close().await.unwrap();
    let hung = tokio::time::timeout(Duration::from_secs(5), hanging)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        hung,
        Err(TetherError::Remote {
            code: Code::Unavailable,
            ..
        })
    ));
}

#[tokio::test]
async fn test_unknown_method_is_not_found() {
    let fx = Fixture::new("unknown").await;
    let err = fx
        .root
        .call::<_, Value>("launch_rockets", &Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TetherError::Remote {
            code: Code::NotFound,
            ..
        }
    ));
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let fx = Fixture::new("shutdown").await;
    let child = fx.spawn("child", false).await;

    fx.host.shutdown().await.unwrap();

    let mut stop = fx.plugin.stop_signal();
    tokio::time::timeout(Duration::from_secs(5), stop.stopped())
        .await
        .unwrap();
    // The plugin side tears down on its own once the link drops.
    tokio::time::timeout(Duration::from_secs(5), fx.plugin.closed())
        .await
        .unwrap();
    assert!(fx.plugin.live_resources().is_empty());

    // Children close through their parent, after it.
    assert_eq!(fx.closed(), vec!["root", "child"]);

    assert!(matches!(
        label(&child).await,
        Err(TetherError::ConnectionClosed)
    ));
    assert!(matches!(
        fx.host.dial(child.id()).await,
        Err(TetherError::ConnectionClosed)
    ));
    // Closing after shutdown is still harmless.
    child.close().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_children_in_spawn_order() {
    // Close delays that would reverse the order if endpoints stopped together.
    let fx = Fixture::with_root_close_delay("shutdown-order", Duration::from_millis(50)).await;
    for (label, close_delay_ms) in [("first", 30), ("second", 0)] {
        fx.spawn_with(SpawnParams {
            label: label.to_string(),
            fail_close: false,
            close_delay_ms,
        })
        .await;
    }

    fx.plugin.shutdown().await.unwrap();

    assert_eq!(fx.closed(), vec!["root", "first", "second"]);
    assert!(fx.plugin.live_resources().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_children_left_without_a_parent_chain() {
    let (_host, plugin) = Broker::pair("shutdown-sweep");
    let log: CloseLog = Arc::default();
    let (_id, child) = plugin
        .serve_new(
            "Node",
            Arc::new(CapabilityServer::new(Node::new("child", &log), None)),
            Vec::new(),
        )
        .unwrap();
    // Handed to a chain that never gets closed.
    let orphaned = Resource::from(child);
    plugin.shutdown().await.unwrap();

    assert_eq!(log.lock().unwrap().clone(), vec!["child"]);
    assert!(plugin.live_resources().is_empty());
    drop(orphaned);
}

/// Answers `blob` with a string of the requested length.
struct Blob;

#[async_trait]
impl Service for Blob {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "blob" => {
                let len: usize = serde_json::from_value(params)?;
                Ok(Value::from("x".repeat(len)))
            }
            _ => Err(method_not_found("Blob", method)),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_oversized_reply_fails_only_that_call() {
    let config = BrokerConfig {
        max_frame_size: 4096,
        ..BrokerConfig::default()
    };
    let (host_io, plugin_io) = tokio::io::duplex(LinkConfig::DUPLEX_BUFFER_SIZE);
    let host = Broker::with_config("capped/host", host_io, config.clone());
    let plugin = Broker::with_config("capped/plugin", plugin_io, config);
    let (id, _handle) = plugin.serve_new("Blob", Arc::new(Blob), Vec::new()).unwrap();
    let conn = host.dial(id).await.unwrap();

    let err = conn.invoke("blob", json!(10_000)).await.unwrap_err();
    match &err {
        TetherError::Remote { code, .. } => assert_eq!(*code, Code::Unknown),
        other => panic!("Expected Remote, got: {:?}", other),
    }
    assert!(!err.is_close_race());

    assert_eq!(conn.invoke("blob", json!(3)).await.unwrap(), json!("xxx"));
    assert!(!host.is_stopped());
    assert!(!plugin.is_stopped());

    let err = conn
        .invoke("blob", Value::from("y".repeat(10_000)))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Protocol { .. }));
    assert!(!host.is_stopped());
}
