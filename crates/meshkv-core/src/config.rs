//! Centralized configuration for meshkv.
//!
//! Static defaults live as associated constants; the per-node values a binary
//! assembles from its command line are carried in [`NodeConfig`].

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mesh RPC transport defaults.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 9898;
    /// Per-call wait for a remote reply.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
    /// Upper bound on establishing a peer connection. Never exceeds the call timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Concurrently served inbound connections per node.
    pub const MAX_CONNECTIONS: usize = 1024;
    /// Frames queued for a connection's writer before calls are rejected as overloaded.
    pub const WRITE_QUEUE_DEPTH: usize = 256;
    /// Requests from one inbound connection that may run at once.
    pub const MAX_IN_FLIGHT_PER_CONNECTION: usize = 256;
}

/// HTTP bootstrap surface defaults.
pub struct HttpConfig;

impl HttpConfig {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 8080;
    /// Requests the HTTP surface serves at once.
    pub const MAX_IN_FLIGHT: usize = 256;
}

/// Runtime configuration of a single mesh node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host the RPC listener binds to; also the host part of the advertised address.
    pub rpc_host: String,
    /// RPC port; `0` binds an ephemeral port.
    pub rpc_port: u16,
    pub rpc_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_message_size: usize,
    pub max_connections: usize,
    /// Requests from one inbound connection served at once.
    pub max_in_flight: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_host: RpcConfig::DEFAULT_HOST.to_string(),
            rpc_port: RpcConfig::DEFAULT_PORT,
            rpc_timeout_ms: RpcConfig::DEFAULT_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: RpcConfig::CONNECT_TIMEOUT.as_millis() as u64,
            max_message_size: RpcConfig::MAX_MESSAGE_SIZE,
            max_connections: RpcConfig::MAX_CONNECTIONS,
            max_in_flight: RpcConfig::MAX_IN_FLIGHT_PER_CONNECTION,
        }
    }
}

impl NodeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Dial bound, capped at the call timeout so an unreachable peer is
    /// reported no later than a slow one.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.min(self.rpc_timeout_ms))
    }

    /// `host:port` the RPC listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }

    /// Reject values that would make every remote call fail.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_host.trim().is_empty() {
            return Err(MeshError::Config {
                message: "rpc_host must not be empty".to_string(),
            });
        }
        if self.rpc_timeout_ms == 0 {
            return Err(MeshError::Config {
                message: "rpc_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(MeshError::Config {
                message: "connect_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(MeshError::Config {
                message: format!(
                    "max_message_size must be between 1 and {}, got {}",
                    u32::MAX,
                    self.max_message_size
                ),
            });
        }
        if self.max_connections == 0 {
            return Err(MeshError::Config {
                message: "max_connections must be greater than zero".to_string(),
            });
        }
        if self.max_in_flight == 0 {
            return Err(MeshError::Config {
                message: "max_in_flight must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
