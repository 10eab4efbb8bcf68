//! Error types for meshkv.
//!
//! One enum covers routing, transport and storage failures so that an error
//! raised by a handler on a remote node can be carried back over the wire and
//! surface on the caller with the same kind.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Main error type for meshkv.
#[derive(Debug, Error)]
pub enum MeshError {
    // Routing errors
    #[error("Failed to dial {destination}: {source}")]
    DialFailed {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to call {method} on {destination}: {source}")]
    CallFailed {
        method: String,
        destination: String,
        #[source]
        source: Box<MeshError>,
    },

    #[error("{method} on {destination} timed out after {timeout:?}")]
    TimedOut {
        method: String,
        destination: String,
        timeout: Duration,
    },

    #[error("Connection to {destination} closed")]
    ConnectionClosed { destination: String },

    #[error("Write queue to {destination} is full")]
    Overloaded { destination: String },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Invalid node address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// An error reported by a peer whose code has no local kind.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    // Storage errors
    #[error("key not found")]
    KeyNotFound,

    #[error("existing key")]
    ExistingKey,

    #[error("stale data current > requested: {current} > {requested}")]
    StaleData { current: i64, requested: i64 },

    // System errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for meshkv operations.
pub type Result<T> = std::result::Result<T, MeshError>;

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Application-defined JSON-RPC error codes (-32000 to -32099).
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const UNREACHABLE: i32 = -32000;
    pub const TIMED_OUT: i32 = -32001;
    pub const DEADLINE_EXCEEDED: i32 = -32002;
    pub const OVERLOADED: i32 = -32003;
    pub const KEY_NOT_FOUND: i32 = -32010;
    pub const EXISTING_KEY: i32 = -32011;
    pub const STALE_DATA: i32 = -32012;
}

impl MeshError {
    /// Convert to a JSON-RPC error code.
    ///
    /// A `CallFailed` reports the code of the error it wraps, so a node that
    /// forwarded a request hands the original kind back to its own caller.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            MeshError::CallFailed { source, .. } => source.to_rpc_error_code(),
            MeshError::DialFailed { .. } | MeshError::ConnectionClosed { .. } => {
                codes::UNREACHABLE
            }
            MeshError::TimedOut { .. } => codes::TIMED_OUT,
            MeshError::Overloaded { .. } => codes::OVERLOADED,
            MeshError::DeadlineExceeded(_) => codes::DEADLINE_EXCEEDED,
            MeshError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            MeshError::InvalidParams { .. } | MeshError::InvalidAddress { .. } => {
                codes::INVALID_PARAMS
            }
            MeshError::Json { .. } => codes::PARSE_ERROR,
            MeshError::Protocol { .. } => codes::INVALID_REQUEST,
            MeshError::Remote { code, .. } => *code,
            MeshError::KeyNotFound => codes::KEY_NOT_FOUND,
            MeshError::ExistingKey => codes::EXISTING_KEY,
            MeshError::StaleData { .. } => codes::STALE_DATA,
            MeshError::Io { .. } | MeshError::Config { .. } => codes::INTERNAL_ERROR,
        }
    }

    /// Structured detail sent alongside the code, for kinds that carry fields.
    pub fn to_rpc_error_data(&self) -> Option<Value> {
        match self {
            MeshError::CallFailed { source, .. } => source.to_rpc_error_data(),
            MeshError::MethodNotFound(method) => Some(json!({ "method": method })),
            MeshError::StaleData { current, requested } => {
                Some(json!({ "current": current, "requested": requested }))
            }
            _ => None,
        }
    }

    /// Rebuild an error received from a peer.
    ///
    /// Kinds that the caller is expected to match on are restored; everything
    /// else is kept as `Remote` with the peer's code and message.
    pub fn from_rpc_error(code: i32, message: String, data: Option<&Value>) -> Self {
        match code {
            codes::KEY_NOT_FOUND => MeshError::KeyNotFound,
            codes::EXISTING_KEY => MeshError::ExistingKey,
            codes::STALE_DATA => {
                let field = |name: &str| data.and_then(|d| d.get(name)).and_then(Value::as_i64);
                match (field("current"), field("requested")) {
                    (Some(current), Some(requested)) => MeshError::StaleData { current, requested },
                    _ => MeshError::Remote { code, message },
                }
            }
            codes::METHOD_NOT_FOUND => {
                match data.and_then(|d| d.get("method")).and_then(Value::as_str) {
                    Some(method) => MeshError::MethodNotFound(method.to_string()),
                    None => MeshError::Remote { code, message },
                }
            }
            codes::INVALID_PARAMS => MeshError::InvalidParams { message },
            _ => MeshError::Remote { code, message },
        }
    }

    /// The innermost error, looking through `CallFailed` wrappers.
    pub fn root_cause(&self) -> &MeshError {
        match self {
            MeshError::CallFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the local wait for a remote reply ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MeshError::TimedOut { .. })
    }

    /// Whether the destination could not be reached at all.
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, MeshError::DialFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::TimedOut {
            method: "Ping".into(),
            destination: "node-b:9898".into(),
            timeout: Duration::from_millis(10),
        };
        assert_eq!(err.to_string(), "Ping on node-b:9898 timed out after 10ms");
    }

    #[test]
    fn test_call_failed_reports_inner_code() {
        let err = MeshError::CallFailed {
            method: "ReadKV".into(),
            destination: "node-b:9898".into(),
            source: Box::new(MeshError::KeyNotFound),
        };
        assert_eq!(err.to_rpc_error_code(), codes::KEY_NOT_FOUND);
        assert!(matches!(err.root_cause(), MeshError::KeyNotFound));
    }

    #[test]
    fn test_stale_data_survives_the_wire() {
        let err = MeshError::StaleData {
            current: 20,
            requested: 10,
        };
        let data = err.to_rpc_error_data();
        let restored =
            MeshError::from_rpc_error(err.to_rpc_error_code(), err.to_string(), data.as_ref());
        match restored {
            MeshError::StaleData { current, requested } => {
                assert_eq!(current, 20);
                assert_eq!(requested, 10);
            }
            other => panic!("Expected StaleData, got: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_code_kept_as_remote() {
        let restored = MeshError::from_rpc_error(-32050, "boom".into(), None);
        assert!(matches!(restored, MeshError::Remote { code: -32050, .. }));
    }

    #[test]
    fn test_timeout_and_dial_predicates() {
        let dial = MeshError::DialFailed {
            destination: "127.0.0.1:1".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(dial.is_dial_failure());
        assert!(!dial.is_timeout());
        assert_eq!(dial.to_rpc_error_code(), codes::UNREACHABLE);
    }

    #[test]
    fn test_overloaded_is_distinct_from_timeout() {
        let err = MeshError::Overloaded {
            destination: "node-b:9898".into(),
        };
        assert!(!err.is_timeout());
        assert_eq!(err.to_rpc_error_code(), codes::OVERLOADED);
    }
}
