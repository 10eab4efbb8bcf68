//! Location-transparent RPC between mesh nodes.
//!
//! Any node can call a named method on any other node through the same
//! interface it uses for local calls. Requests carry `source`/`dest` addresses
//! and the [`Router`] on each node decides whether to execute in place or
//! forward. Uses length-prefixed JSON-RPC 2.0 over persistent TCP connections.
//!
//! # Architecture
//!
//! - **Pool**: one lazily dialed, multiplexed connection per destination
//! - **Invoker**: issues a call over a pooled connection, bounded by a timeout
//! - **Router**: local-or-remote decision over an explicit handler table
//! - **Server**: answers calls from peers by handing them to the router
//! - **Protocol**: framing and JSON-RPC types shared by both sides

pub mod connection;
pub mod invoker;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use connection::{PeerConnection, PendingCall};
pub use invoker::RemoteInvoker;
pub use node::{MeshNode, MeshNodeBuilder};
pub use pool::{ConnectionPool, PoolStats};
pub use protocol::{Envelope, MeshRequest, MeshResponse, RequestArgs};
pub use registry::{Handler, HandlerTable};
pub use router::{Route, Router};
pub use server::{MeshDispatch, MeshServer, MeshServerHandle, ServerLimits};
