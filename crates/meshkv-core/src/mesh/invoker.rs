//! Timeout-bounded remote invocation over pooled connections.

use super::pool::ConnectionPool;
use crate::address::NodeAddress;
use crate::error::{MeshError, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Issues named calls on remote nodes and races each against a timeout.
///
/// The timeout applies per call and starts once the call has been queued on
/// its connection. Dialing is bounded by the pool's connect timeout and
/// queueing never waits: a connection whose write queue is full fails the
/// call with `Overloaded` right away. A call that times out is abandoned
/// locally, and the peer is told the same budget so it can stop working on
/// it. Nothing is retried.
#[derive(Debug, Clone)]
pub struct RemoteInvoker {
    pool: Arc<ConnectionPool>,
    timeout: Duration,
}

impl RemoteInvoker {
    pub fn new(pool: Arc<ConnectionPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `method` on `destination` with `params`.
    ///
    /// Fails with `DialFailed` when the destination cannot be reached,
    /// `TimedOut` when no reply arrives in time, and `CallFailed` wrapping the
    /// peer's (or the transport's) error otherwise.
    pub async fn invoke(
        &self,
        destination: &NodeAddress,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let conn = self.pool.get(destination).await?;

        let call = conn
            .submit(method, params, Some(self.timeout))
            .map_err(|e| call_failed(method, destination, e))?;
        debug!("{}: routed to {} as call {}", method, destination, call.id());

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(call_failed(method, destination, e)),
            Err(_) => {
                warn!(
                    "{} on {} timed out after {:?}",
                    method, destination, self.timeout
                );
                Err(MeshError::TimedOut {
                    method: method.to_string(),
                    destination: destination.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

fn call_failed(method: &str, destination: &NodeAddress, source: MeshError) -> MeshError {
    MeshError::CallFailed {
        method: method.to_string(),
        destination: destination.to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::mesh::protocol::{read_frame, write_frame, MeshRequest, MeshResponse};
    use crate::error::codes;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// Peer that replies after `delay`, echoing params or failing `Missing`.
    async fn scripted_peer(delay: Duration) -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    while let Ok(Some(frame)) =
                        read_frame(&mut reader, RpcConfig::MAX_MESSAGE_SIZE).await
                    {
                        let req: MeshRequest = serde_json::from_slice(&frame).unwrap();
                        tokio::time::sleep(delay).await;
                        let resp = if req.method == "Missing" {
                            MeshResponse::from_error(req.id, &MeshError::KeyNotFound)
                        } else {
                            MeshResponse::success(req.id, req.params.unwrap_or(Value::Null))
                        };
                        if write_frame(&mut writer, &serde_json::to_vec(&resp).unwrap())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn invoker(timeout: Duration) -> RemoteInvoker {
        let pool = Arc::new(ConnectionPool::new(
            RpcConfig::CONNECT_TIMEOUT,
            RpcConfig::MAX_MESSAGE_SIZE,
        ));
        RemoteInvoker::new(pool, timeout)
    }

    #[tokio::test]
    async fn test_invoke_returns_reply() {
        let addr = scripted_peer(Duration::ZERO).await;
        let invoker = invoker(Duration::from_secs(2));

        let reply = invoker
            .invoke(&addr, "Echo", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let addr = scripted_peer(Duration::from_millis(500)).await;
        let invoker = invoker(Duration::from_millis(50));

        let start = Instant::now();
        let err = invoker
            .invoke(&addr, "Echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert!(start.elapsed() < Duration::from_millis(400));
        assert_eq!(err.to_rpc_error_code(), codes::TIMED_OUT);
    }

    #[tokio::test]
    async fn test_remote_error_is_wrapped_with_context() {
        let addr = scripted_peer(Duration::ZERO).await;
        let invoker = invoker(Duration::from_secs(2));

        let err = invoker
            .invoke(&addr, "Missing", serde_json::json!({}))
            .await
            .unwrap_err();
        match &err {
            MeshError::CallFailed {
                method,
                destination,
                source,
            } => {
                assert_eq!(method, "Missing");
                assert_eq!(destination, addr.as_str());
                assert!(matches!(**source, MeshError::KeyNotFound));
            }
            other => panic!("Expected CallFailed, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_cannot_hold_callers_past_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        // Accept and hold the socket without ever reading from it.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let invoker = invoker(Duration::from_millis(100));
        let payload = serde_json::json!("x".repeat(64 * 1024));

        let mut handles = Vec::new();
        for _ in 0..600 {
            let invoker = invoker.clone();
            let addr = addr.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_secs(3),
                    invoker.invoke(&addr, "Bulk", payload),
                )
                .await
            }));
        }

        for handle in handles {
            let outcome = handle
                .await
                .unwrap()
                .expect("invoke must return within its own timeout");
            let err = outcome.unwrap_err();
            let overloaded = matches!(err.root_cause(), MeshError::Overloaded { .. });
            assert!(
                err.is_timeout() || overloaded,
                "expected timeout or overload, got {:?}",
                err
            );
        }
    }

    #[tokio::test]
    async fn test_unreachable_destination_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        drop(listener);
        let invoker = invoker(Duration::from_secs(5));

        let start = Instant::now();
        let err = invoker
            .invoke(&addr, "Echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_dial_failure(), "expected dial failure, got {:?}", err);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
