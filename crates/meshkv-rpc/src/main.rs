//! meshkv node - mesh RPC listener with a JSON-RPC over HTTP front door.
//!
//! Peers reach the node on its RPC address; clients use the HTTP surface.
//! Both paths go through the same router, so any request may name any node
//! in the mesh as its destination.

mod handler;
mod handlers;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use handlers::{PingRequest, PingResponse};
use meshkv_core::{HttpConfig, KvStore, MeshNode, NodeAddress, NodeConfig, RequestArgs, RpcConfig};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "meshkv-rpc")]
#[command(about = "Mesh key-value node")]
struct Args {
    /// Host for the mesh RPC listener, also advertised to peers
    #[arg(long, env = "MESHKV_RPC_HOST", default_value = RpcConfig::DEFAULT_HOST)]
    rpc_host: String,

    /// Mesh RPC port (0 = auto-assign)
    #[arg(long, env = "MESHKV_RPC_PORT", default_value_t = RpcConfig::DEFAULT_PORT)]
    rpc_port: u16,

    /// Milliseconds to wait for a remote reply
    #[arg(long, env = "MESHKV_RPC_TIMEOUT_MS", default_value_t = 1000)]
    rpc_timeout_ms: u64,

    /// Host for the HTTP server
    #[arg(long, env = "MESHKV_HTTP_HOST", default_value = HttpConfig::DEFAULT_HOST)]
    http_host: String,

    /// HTTP port (0 = auto-assign)
    #[arg(long, env = "MESHKV_HTTP_PORT", default_value_t = HttpConfig::DEFAULT_PORT)]
    http_port: u16,

    /// Enable debug logging
    #[arg(short, long, env = "MESHKV_DEBUG")]
    debug: bool,

    /// Ping this node once the server is up
    #[arg(long, env = "MESHKV_PING")]
    ping: Option<NodeAddress>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting meshkv node");

    let config = NodeConfig {
        rpc_host: args.rpc_host.clone(),
        rpc_port: args.rpc_port,
        rpc_timeout_ms: args.rpc_timeout_ms,
        ..NodeConfig::default()
    };
    let store = Arc::new(KvStore::new());

    let mut node = MeshNode::builder()
        .config(config)
        .handlers(move |local, table| handlers::install(local, table, store))
        .build()
        .await
        .context("failed to start mesh node")?;

    let http_addr = server::start_server(node.router().clone(), &args.http_host, args.http_port)
        .await
        .context("failed to start HTTP server")?;

    // Announce addresses on stdout for supervisors and tests
    println!("RPC_ADDR={}", node.address());
    println!("HTTP_PORT={}", http_addr.port());

    info!("Node {} ready, HTTP on {}", node.address(), http_addr);

    if let Some(target) = args.ping {
        let request = PingRequest {
            args: RequestArgs::new(node.address().clone(), target.clone()),
            message: "hi".to_string(),
        };
        match node
            .router()
            .call::<_, PingResponse>(handlers::PING, &request)
            .await
        {
            Ok(reply) => info!("Ping {}: {}", target, reply.message),
            Err(e) => warn!("Ping {} failed: {}", target, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    node.shutdown();

    Ok(())
}
