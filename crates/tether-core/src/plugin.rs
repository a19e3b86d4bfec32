//! Plugin process launch and handshake.
//!
//! The plugin binds a TCP listener, prints `RPC_PORT=<port>` on stdout and
//! accepts exactly one link. The host spawns the plugin, reads that line,
//! connects, and from then on both sides talk only through their brokers.

use crate::broker::{Broker, BrokerExt, EndpointHandle, Service};
use crate::config::LinkConfig;
use crate::error::{Result, TetherError};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Parse a handshake line. Returns `None` for any other output.
pub fn parse_handshake(line: &str) -> Option<Result<u16>> {
    let value = line.trim().strip_prefix(LinkConfig::HANDSHAKE_PREFIX)?;
    Some(value.trim().parse::<u16>().map_err(|e| TetherError::Plugin {
        message: format!("invalid port in handshake '{}': {}", value, e),
    }))
}

/// A running plugin process and the host side of its link.
pub struct PluginProcess {
    name: String,
    child: Child,
    port: u16,
    broker: Broker,
    stdout_drain: Option<JoinHandle<()>>,
}

impl PluginProcess {
    /// Spawn `command`, wait for its handshake and connect.
    ///
    /// The child is killed if the handshake does not arrive within
    /// [`LinkConfig::HANDSHAKE_TIMEOUT`].
    pub async fn launch(name: impl Into<String>, mut command: Command) -> Result<Self> {
        let name = name.into();
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TetherError::Plugin {
                message: format!("failed to spawn plugin {}: {}", name, e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| TetherError::Plugin {
            message: format!("plugin {} stdout not captured", name),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::Instant::now() + LinkConfig::HANDSHAKE_TIMEOUT;
        let port = loop {
            let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    return Err(TetherError::Plugin {
                        message: format!("plugin {} exited before handshake", name),
                    })
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(TetherError::Timeout(LinkConfig::HANDSHAKE_TIMEOUT)),
            };
            match parse_handshake(&line) {
                Some(port) => break port?,
                None => debug!("Plugin {} stdout: {}", name, line),
            }
        };

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let broker = Broker::connect(format!("{}/host", name), addr).await?;

        // Keep the pipe drained so the plugin never blocks on stdout.
        let drain_name = name.clone();
        let stdout_drain = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("Plugin {} stdout: {}", drain_name, line);
            }
        });

        info!("Plugin {} running on port {}", name, port);

        Ok(Self {
            name,
            child,
            port,
            broker,
            stdout_drain: Some(stdout_drain),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host side broker of the link.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Shut the link down, then wait for the plugin to exit.
    ///
    /// A plugin that outlives [`LinkConfig::PROCESS_EXIT_TIMEOUT`] is killed.
    pub async fn shutdown(mut self) -> Result<()> {
        let result = self.broker.shutdown().await;

        match tokio::time::timeout(LinkConfig::PROCESS_EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Plugin {} exited with {}", self.name, status),
            Ok(Err(e)) => warn!("Failed to wait for plugin {}: {}", self.name, e),
            Err(_) => {
                warn!("Plugin {} did not exit, killing", self.name);
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill plugin {}: {}", self.name, e);
                }
            }
        }

        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        info!("Plugin {} stopped", self.name);
        result
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Plugin side of the handshake.
pub struct PluginListener {
    listener: TcpListener,
}

impl PluginListener {
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The line the host waits for.
    pub fn handshake_line(&self) -> Result<String> {
        Ok(format!(
            "{}{}",
            LinkConfig::HANDSHAKE_PREFIX,
            self.local_addr()?.port()
        ))
    }

    /// Accept the host's link and serve `root` at [`ResourceId::ROOT`].
    ///
    /// `root` receives the broker context its server adapter spawns children
    /// through.
    ///
    /// [`ResourceId::ROOT`]: crate::ResourceId::ROOT
    pub async fn accept<F>(self, name: &str, root: F) -> Result<(Broker, EndpointHandle)>
    where
        F: FnOnce(BrokerExt) -> Arc<dyn Service>,
    {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!("Plugin {} accepted link from {}", name, peer);

        let broker = Broker::new(format!("{}/plugin", name), stream);
        let service = root(BrokerExt::new(broker.clone(), name));
        let handle = broker.serve_root(name, service)?;
        Ok((broker, handle))
    }
}
