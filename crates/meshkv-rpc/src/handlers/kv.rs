//! Timestamped key-value reads and writes against the node's local store.

use meshkv_core::{Envelope, KvStore, RequestArgs, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteKvRequest {
    #[serde(flatten)]
    pub args: RequestArgs,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

impl Envelope for WriteKvRequest {
    fn args(&self) -> &RequestArgs {
        &self.args
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteKvResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadKvRequest {
    #[serde(flatten)]
    pub args: RequestArgs,
    pub key: Vec<u8>,
}

impl Envelope for ReadKvRequest {
    fn args(&self) -> &RequestArgs {
        &self.args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadKvResponse {
    pub value: Vec<u8>,
    pub timestamp: i64,
}

pub(super) async fn write_kv(store: Arc<KvStore>, req: WriteKvRequest) -> Result<WriteKvResponse> {
    debug!(
        "WriteKV from {}: {} byte key at {}",
        req.args.source,
        req.key.len(),
        req.timestamp
    );
    store.insert(req.key, req.value, req.timestamp)?;
    Ok(WriteKvResponse {})
}

pub(super) async fn read_kv(store: Arc<KvStore>, req: ReadKvRequest) -> Result<ReadKvResponse> {
    let found = store.read(&req.key)?;
    Ok(ReadKvResponse {
        value: found.value,
        timestamp: found.timestamp,
    })
}
