use meshkv_core::{Envelope, NodeAddress, RequestArgs, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(flatten)]
    pub args: RequestArgs,
    pub message: String,
}

impl Envelope for PingRequest {
    fn args(&self) -> &RequestArgs {
        &self.args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
}

pub(super) async fn ping(local: NodeAddress, req: PingRequest) -> Result<PingResponse> {
    debug!("Ping from {}: {}", req.args.source, req.message);
    Ok(PingResponse {
        message: format!("Pong from meshkv {}, message: {}", local, req.message),
    })
}
