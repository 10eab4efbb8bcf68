//! Mesh wire protocol: message types and framing.
//!
//! Every message on a peer connection is a length-prefixed JSON-RPC 2.0
//! object:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests may carry a `deadline_ms` extension telling the serving node how
//! long the caller will keep waiting. Addressing (`source`/`dest`) travels
//! inside `params` as part of the application payload.

use crate::address::NodeAddress;
use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request exchanged between mesh nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
    /// Milliseconds the caller will wait for the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl MeshRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::Number(id.into())),
            deadline_ms: None,
        }
    }

    /// Attach the caller's remaining wait budget.
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline_ms = Some(budget.as_millis().max(1) as u64);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// JSON-RPC 2.0 response exchanged between mesh nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub id: Option<Value>,
}

impl MeshResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(WireError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Create an error response carrying the kind of `err`.
    pub fn from_error(id: Option<Value>, err: &MeshError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(WireError {
                code: err.to_rpc_error_code(),
                message: err.to_string(),
                data: err.to_rpc_error_data(),
            }),
            id,
        }
    }

    /// Numeric id used to match the response to its pending call.
    pub fn call_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Turn the response into the call's outcome.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(err.into_mesh_error()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    pub fn into_mesh_error(self) -> MeshError {
        MeshError::from_rpc_error(self.code, self.message, self.data.as_ref())
    }
}

/// Addressing fields embedded in every mesh request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestArgs {
    /// Node that originated the request.
    pub source: NodeAddress,
    /// Node that should execute the request.
    pub dest: NodeAddress,
}

impl RequestArgs {
    pub fn new(source: NodeAddress, dest: NodeAddress) -> Self {
        Self { source, dest }
    }

    /// Read the addressing fields out of a request's params.
    pub fn from_params(params: &Value) -> Result<Self> {
        RequestArgs::deserialize(params).map_err(|e| MeshError::InvalidParams {
            message: format!("missing or malformed addressing fields: {}", e),
        })
    }
}

/// A request that can be routed through the mesh.
///
/// Request structs embed [`RequestArgs`] with `#[serde(flatten)]` and expose
/// it here.
pub trait Envelope {
    fn args(&self) -> &RequestArgs;

    fn destination(&self) -> &NodeAddress {
        &self.args().dest
    }

    fn source(&self) -> &NodeAddress {
        &self.args().source
    }
}

impl Envelope for RequestArgs {
    fn args(&self) -> &RequestArgs {
        self
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(MeshError::Protocol {
            message: format!("frame size {} exceeds maximum {}", len, max_size),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| MeshError::Protocol {
        message: format!("frame of {} bytes does not fit a u32 length", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
