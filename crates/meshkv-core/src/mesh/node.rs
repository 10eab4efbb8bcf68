//! Builder that wires a listener, handler table, pool and router into a node.

use super::invoker::RemoteInvoker;
use super::pool::ConnectionPool;
use super::registry::HandlerTable;
use super::router::Router;
use super::server::{MeshServer, MeshServerHandle, ServerLimits};
use crate::address::NodeAddress;
use crate::config::NodeConfig;
use crate::error::{MeshError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

type Installer = Box<dyn FnOnce(&NodeAddress, &mut HandlerTable) + Send>;

/// A running mesh node: an RPC listener serving its router.
///
/// Dropping the node stops its server.
pub struct MeshNode {
    router: Arc<Router>,
    server: MeshServerHandle,
}

impl MeshNode {
    pub fn builder() -> MeshNodeBuilder {
        MeshNodeBuilder::new()
    }

    /// Address peers use to reach this node, and the `dest` it executes locally.
    pub fn address(&self) -> &NodeAddress {
        self.router.local_address()
    }

    /// Socket the RPC listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn shutdown(&mut self) {
        info!("Stopping mesh node {}", self.router.local_address());
        self.server.shutdown();
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("address", self.address())
            .field("listen_addr", &self.listen_addr())
            .finish()
    }
}

/// Builder for configuring a [`MeshNode`].
///
/// # Example
///
/// ```rust,ignore
/// let node = MeshNode::builder()
///     .rpc_host("127.0.0.1")
///     .rpc_port(0)
///     .handlers(|local, table| register_handlers(local, table))
///     .build()
///     .await?;
/// ```
pub struct MeshNodeBuilder {
    config: NodeConfig,
    installers: Vec<Installer>,
}

impl MeshNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            installers: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rpc_host(mut self, host: impl Into<String>) -> Self {
        self.config.rpc_host = host.into();
        self
    }

    /// Port to bind. `0` picks an ephemeral port, which is then advertised.
    pub fn rpc_port(mut self, port: u16) -> Self {
        self.config.rpc_port = port;
        self
    }

    /// Per-call wait for remote replies.
    ///
    /// Default: 1000ms
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Add handlers to the node's table.
    ///
    /// `install` runs during [`build`](Self::build), once the advertised
    /// address is known, so handlers can capture it.
    pub fn handlers<F>(mut self, install: F) -> Self
    where
        F: FnOnce(&NodeAddress, &mut HandlerTable) + Send + 'static,
    {
        self.installers.push(Box::new(install));
        self
    }

    /// Bind the RPC listener and start serving.
    pub async fn build(self) -> Result<MeshNode> {
        self.config.validate()?;

        let bind = self.config.bind_address();
        let listener = TcpListener::bind(&bind).await.map_err(|e| MeshError::Io {
            message: format!("Failed to bind RPC listener on {}: {}", bind, e),
            source: Some(e),
        })?;
        let port = listener.local_addr()?.port();
        let address = NodeAddress::from_parts(&self.config.rpc_host, port)?;

        let mut table = HandlerTable::new();
        for install in self.installers {
            install(&address, &mut table);
        }
        info!(
            "Mesh node {} serving methods: {:?}",
            address,
            table.methods()
        );

        let pool = Arc::new(ConnectionPool::from_config(&self.config));
        let invoker = RemoteInvoker::new(pool, self.config.rpc_timeout());
        let router = Arc::new(Router::new(address, Arc::new(table), invoker));

        let server = MeshServer::start(
            listener,
            router.clone(),
            ServerLimits {
                max_connections: self.config.max_connections,
                max_message_size: self.config.max_message_size,
                max_in_flight: self.config.max_in_flight,
            },
        )?;

        Ok(MeshNode { router, server })
    }
}

impl Default for MeshNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
