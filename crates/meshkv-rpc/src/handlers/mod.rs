//! Mesh method handlers served by this node, split by domain.
//!
//! Every request type flattens `RequestArgs` so the router can read its
//! destination; the handlers themselves only ever run on that destination.

mod kv;
mod ping;

pub use ping::{PingRequest, PingResponse};

use kv::{ReadKvRequest, WriteKvRequest};
use meshkv_core::{HandlerTable, KvStore, NodeAddress};
use std::sync::Arc;

pub const PING: &str = "Ping";
pub const WRITE_KV: &str = "WriteKV";
pub const READ_KV: &str = "ReadKV";

/// Register every method this node answers.
pub fn install(local: &NodeAddress, table: &mut HandlerTable, store: Arc<KvStore>) {
    let me = local.clone();
    let write_store = store.clone();
    table
        .register(PING, move |req: PingRequest| ping::ping(me.clone(), req))
        .register(WRITE_KV, move |req: WriteKvRequest| {
            kv::write_kv(write_store.clone(), req)
        })
        .register(READ_KV, move |req: ReadKvRequest| kv::read_kv(store.clone(), req));
}
