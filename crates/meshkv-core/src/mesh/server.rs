//! TCP server answering mesh calls from peer nodes.
//!
//! Accepts connections on the node's RPC listener and hands every request to a
//! [`MeshDispatch`] implementation (normally the node's `Router`). Requests on
//! one connection are served concurrently, up to a per-connection limit, and
//! replies go back through a single writer task matched to their calls by id.
//! Once a connection is at its limit the server stops reading from it until
//! a running request finishes.
//!
//! A request carrying `deadline_ms` is bounded by it: when the budget runs out
//! the handler future is dropped and the caller gets `DeadlineExceeded`.

use super::protocol::{read_frame, write_frame, MeshRequest, MeshResponse, JSONRPC_VERSION};
use crate::config::RpcConfig;
use crate::error::{codes, MeshError, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Handle to a running mesh server. Dropping shuts down the server.
pub struct MeshServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MeshServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close the ones being served.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for MeshServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Executes a named call received from a peer.
#[async_trait::async_trait]
pub trait MeshDispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value>;
}

/// Limits applied to inbound connections.
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    pub max_connections: usize,
    pub max_message_size: usize,
    /// Requests from one connection running at once.
    pub max_in_flight: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: RpcConfig::MAX_CONNECTIONS,
            max_message_size: RpcConfig::MAX_MESSAGE_SIZE,
            max_in_flight: RpcConfig::MAX_IN_FLIGHT_PER_CONNECTION,
        }
    }
}

pub struct MeshServer;

impl MeshServer {
    /// Serve `dispatch` on an already bound listener.
    pub fn start<D: MeshDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        limits: ServerLimits,
    ) -> Result<MeshServerHandle> {
        let addr = listener.local_addr()?;
        info!("Mesh server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            limits,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(MeshServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: MeshDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        limits: ServerLimits,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Mesh server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= limits.max_connections {
                                warn!(
                                    "Rejecting mesh connection from {}: at max capacity ({})",
                                    peer_addr, limits.max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Mesh connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    dispatch,
                                    limits,
                                    &mut conn_shutdown,
                                )
                                .await
                                {
                                    debug!("Mesh connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Mesh accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: MeshDispatch>(
        stream: TcpStream,
        dispatch: Arc<D>,
        limits: ServerLimits,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let in_flight = Arc::new(Semaphore::new(limits.max_in_flight.max(1)));
        let (mut reader, mut writer) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<MeshResponse>(RpcConfig::WRITE_QUEUE_DEPTH);

        let writer_task = tokio::spawn(async move {
            while let Some(response) = reply_rx.recv().await {
                let bytes = serde_json::to_vec(&response)?;
                write_frame(&mut writer, &bytes).await?;
            }
            Ok::<_, MeshError>(())
        });

        let outcome = loop {
            let permit = tokio::select! {
                permit = in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
                _ = shutdown_rx.changed() => break Ok(()),
            };

            let frame = tokio::select! {
                result = read_frame(&mut reader, limits.max_message_size) => {
                    match result {
                        Ok(Some(f)) => f,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => break Ok(()),
            };

            let dispatch = dispatch.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                // Held until the reply is queued.
                let _permit = permit;
                let response = Self::process_request(&frame, &*dispatch).await;
                // The writer is gone only if the connection already failed.
                let _ = reply_tx.send(response).await;
            });
        };

        drop(reply_tx);
        if outcome.is_err() {
            writer_task.abort();
        }
        outcome
    }

    async fn process_request<D: MeshDispatch + ?Sized>(frame: &[u8], dispatch: &D) -> MeshResponse {
        let request: MeshRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => {
                return MeshResponse::error(None, codes::PARSE_ERROR, format!("Parse error: {}", e));
            }
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return MeshResponse::error(
                request.id,
                codes::INVALID_REQUEST,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let deadline = request.deadline();
        let params = request
            .params
            .unwrap_or_else(|| Value::Object(Default::default()));
        let call = dispatch.dispatch(&request.method, params);

        let outcome = match deadline {
            Some(budget) => match tokio::time::timeout(budget, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!("{}: abandoned after deadline of {:?}", request.method, budget);
                    Err(MeshError::DeadlineExceeded(budget))
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(result) => MeshResponse::success(request.id, result),
            Err(e) => MeshResponse::from_error(request.id, &e),
        }
    }
}
