//! Tether Plugin - demo reader plugin process.
//!
//! Serves a `ReaderProvider` at the root of a single TCP link. The host reads
//! the `RPC_PORT=<port>` line from stdout and connects; logs go to stderr.

mod demo;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tether_core::capabilities::{provider, ReaderProviderService, TokenPrice};
use tether_core::{CapabilityServer, PluginListener, Service};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-plugin")]
#[command(about = "Demo plugin serving reader capabilities over a tether link")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Name reported by the provider
    #[arg(long, default_value = "demo")]
    name: String,

    /// Default token price, as TOKEN=PRICE (repeatable)
    #[arg(long = "price", value_parser = demo::parse_price)]
    prices: Vec<TokenPrice>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout carries the handshake only
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting tether plugin {}", args.name);

    let listener = PluginListener::bind(&args.host, args.port).await?;
    println!("{}", listener.handshake_line()?);
    info!("Listening on {}", listener.local_addr()?);

    let provider = Arc::new(demo::DemoProvider::new(args.name, args.prices));
    let (broker, _root) = listener
        .accept(provider::CAPABILITY, move |ext| {
            let service = ReaderProviderService::new(provider);
            Arc::new(CapabilityServer::new(service, Some(ext))) as Arc<dyn Service>
        })
        .await?;

    let mut stop = broker.stop_signal();
    tokio::select! {
        _ = stop.stopped() => info!("Host closed the link"),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
            broker.shutdown().await?;
        }
    }

    broker.closed().await;
    info!("Plugin stopped");

    Ok(())
}
