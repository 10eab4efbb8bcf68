//! meshkv core - routing, pooling and storage for a mesh key-value node.
//!
//! A node answers to one `host:port` address. Every request names the node
//! that should execute it; the node's [`Router`] runs it locally when that is
//! itself and forwards it over a pooled connection otherwise.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshkv_core::{MeshNode, RequestArgs};
//!
//! #[tokio::main]
//! async fn main() -> meshkv_core::Result<()> {
//!     let node = MeshNode::builder()
//!         .rpc_host("127.0.0.1")
//!         .rpc_port(9898)
//!         .handlers(|local, table| { /* register handlers */ })
//!         .build()
//!         .await?;
//!
//!     let args = RequestArgs::new(node.address().clone(), "10.0.0.2:9898".parse()?);
//!     let reply = node.router().dispatch("Ping", serde_json::to_value(&args)?).await?;
//!     println!("{}", reply);
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod kvstore;
pub mod mesh;

// Re-export commonly used types
pub use address::NodeAddress;
pub use config::{HttpConfig, NodeConfig, RpcConfig};
pub use error::{MeshError, Result};
pub use kvstore::{KvStore, VersionedValue};
pub use mesh::{
    ConnectionPool, Envelope, HandlerTable, MeshDispatch, MeshNode, MeshNodeBuilder, PoolStats,
    RemoteInvoker, RequestArgs, Route, Router,
};
