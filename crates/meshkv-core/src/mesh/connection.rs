//! Persistent, multiplexed connection to one peer.
//!
//! A connection owns two background tasks: a writer draining a bounded queue
//! of encoded requests onto the socket, and a reader matching incoming
//! responses to pending calls by JSON-RPC id. Any number of calls can be in
//! flight at once; each caller holds a [`PendingCall`] future for its reply.
//!
//! Submitting never waits. When the queue is full (the peer has stopped
//! reading) the call fails with `Overloaded`, and frames of calls abandoned
//! while queued are skipped by the writer.
//!
//! # Closure
//!
//! When either task hits EOF or an I/O error the connection is marked closed
//! and every pending call resolves with `ConnectionClosed`. A closed
//! connection is never reopened; the pool replaces it on next use.

use super::protocol::{read_frame, write_frame, MeshRequest, MeshResponse};
use crate::address::NodeAddress;
use crate::config::RpcConfig;
use crate::error::{MeshError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type ReplySlot = oneshot::Sender<Result<Value>>;
type Outbound = (u64, Vec<u8>);

/// State shared between a connection handle, its tasks and its pending calls.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, ReplySlot>>,
    closed: AtomicBool,
}

impl Shared {
    /// Register a reply slot; fails once the connection has closed.
    fn register(&self, id: u64, slot: ReplySlot) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        pending.insert(id, slot);
        true
    }

    fn is_pending(&self, id: u64) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn take(&self, id: u64) -> Option<ReplySlot> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Mark closed and drop every reply slot, failing their calls.
    fn close(&self) {
        let drained = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        if !drained.is_empty() {
            debug!("Failing {} in-flight calls on closed connection", drained.len());
        }
    }

    fn in_flight(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// An open connection to a peer's mesh server.
pub struct PeerConnection {
    destination: NodeAddress,
    outbound: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("destination", &self.destination)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl PeerConnection {
    /// Dial `destination`, giving up after `connect_timeout`.
    pub async fn connect(
        destination: &NodeAddress,
        connect_timeout: Duration,
        max_message_size: usize,
    ) -> std::io::Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(destination.as_str()))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", connect_timeout),
                )
            })??;
        stream.set_nodelay(true)?;

        debug!("Connected to peer {}", destination);
        Ok(Self::from_stream(destination.clone(), stream, max_message_size))
    }

    fn from_stream(destination: NodeAddress, stream: TcpStream, max_message_size: usize) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::channel(RpcConfig::WRITE_QUEUE_DEPTH);
        let shared = Arc::new(Shared::default());

        let writer_task = tokio::spawn(write_loop(
            writer,
            queue,
            shared.clone(),
            destination.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(
            reader,
            shared.clone(),
            destination.clone(),
            max_message_size,
        ));

        Self {
            destination,
            outbound,
            shared,
            next_id: AtomicU64::new(1),
            reader_task,
            writer_task,
        }
    }

    pub fn destination(&self) -> &NodeAddress {
        &self.destination
    }

    /// Whether the transport has closed. A closed connection never recovers.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Queue a call and return a handle to its reply without waiting for it.
    ///
    /// `deadline` is forwarded to the peer so it can stop working on the call
    /// once the caller has stopped waiting. Fails with `Overloaded` when the
    /// write queue is full.
    pub fn submit(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<PendingCall> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = MeshRequest::new(method, params, id);
        if let Some(budget) = deadline {
            request = request.with_deadline(budget);
        }
        let frame = serde_json::to_vec(&request)?;

        let (slot, reply) = oneshot::channel();
        if !self.shared.register(id, slot) {
            return Err(self.closed_error());
        }
        // From here on dropping the call releases its slot.
        let call = PendingCall {
            id,
            reply,
            shared: self.shared.clone(),
            destination: self.destination.clone(),
        };

        match self.outbound.try_send((id, frame)) {
            Ok(()) => Ok(call),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Write queue to {} is full, rejecting call {}", self.destination, id);
                Err(MeshError::Overloaded {
                    destination: self.destination.to_string(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> MeshError {
        MeshError::ConnectionClosed {
            destination: self.destination.to_string(),
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
        self.shared.close();
    }
}

/// An in-flight call on a [`PeerConnection`].
///
/// Resolves with the peer's reply. Dropping it before completion abandons the
/// call locally: the slot is released and a late reply is discarded.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    reply: oneshot::Receiver<Result<Value>>,
    shared: Arc<Shared>,
    destination: NodeAddress,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MeshError::ConnectionClosed {
                destination: self.destination.to_string(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.shared.take(self.id);
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    destination: NodeAddress,
) {
    while let Some((id, frame)) = queue.recv().await {
        if !shared.is_pending(id) {
            continue;
        }
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Write to peer {} failed: {}", destination, e);
            break;
        }
    }
    shared.close();
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    destination: NodeAddress,
    max_message_size: usize,
) {
    loop {
        let frame = match read_frame(&mut reader, max_message_size).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Peer {} closed the connection", destination);
                break;
            }
            Err(e) => {
                warn!("Read from peer {} failed: {}", destination, e);
                break;
            }
        };

        let response: MeshResponse = match serde_json::from_slice(&frame) {
            Ok(response) => response,
            Err(e) => {
                warn!("Malformed response from peer {}: {}", destination, e);
                break;
            }
        };

        let Some(id) = response.call_id() else {
            warn!("Response from peer {} without a call id", destination);
            continue;
        };

        match shared.take(id) {
            Some(slot) => {
                // The caller may have stopped waiting between take and send.
                let _ = slot.send(response.into_result());
            }
            None => debug!("Discarding reply {} from {} for an abandoned call", id, destination),
        }
    }
    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const MAX: usize = RpcConfig::MAX_MESSAGE_SIZE;

    /// Peer that answers every request by echoing its params.
    async fn echo_peer() -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            while let Ok(Some(frame)) = read_frame(&mut reader, MAX).await {
                let req: MeshRequest = serde_json::from_slice(&frame).unwrap();
                let resp = MeshResponse::success(req.id, req.params.unwrap_or(Value::Null));
                write_frame(&mut writer, &serde_json::to_vec(&resp).unwrap())
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_matched_by_id() {
        let addr = echo_peer().await;
        let conn = PeerConnection::connect(&addr, RpcConfig::CONNECT_TIMEOUT, MAX)
            .await
            .unwrap();

        let first = conn.submit("echo", serde_json::json!(1), None).unwrap();
        let second = conn.submit("echo", serde_json::json!(2), None).unwrap();
        assert_ne!(first.id(), second.id());

        assert_eq!(second.await.unwrap(), serde_json::json!(2));
        assert_eq!(first.await.unwrap(), serde_json::json!(1));
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_releases_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        // Accept but never answer.
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let conn = PeerConnection::connect(&addr, RpcConfig::CONNECT_TIMEOUT, MAX)
            .await
            .unwrap();
        let call = conn.submit("Slow", serde_json::json!({}), None).unwrap();
        assert_eq!(conn.in_flight(), 1);
        drop(call);
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = stream.split();
            // Read one request, then hang up without replying.
            let _ = read_frame(&mut reader, MAX).await;
        });

        let conn = PeerConnection::connect(&addr, RpcConfig::CONNECT_TIMEOUT, MAX)
            .await
            .unwrap();
        let call = conn.submit("Ping", serde_json::json!({}), None).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("closure should resolve the call");
        assert!(matches!(outcome, Err(MeshError::ConnectionClosed { .. })));
        assert!(conn.is_closed());

        let err = conn.submit("Ping", serde_json::json!({}), None).unwrap_err();
        assert!(matches!(err, MeshError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_stalled_peer_overloads_instead_of_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        // Accept and hold the socket without ever reading from it.
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let conn = PeerConnection::connect(&addr, RpcConfig::CONNECT_TIMEOUT, MAX)
            .await
            .unwrap();
        let payload = serde_json::json!("x".repeat(64 * 1024));

        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            let mut held = Vec::new();
            for _ in 0..8192 {
                match conn.submit("Bulk", payload.clone(), None) {
                    Ok(call) => held.push(call),
                    Err(e) => return (held.len(), e),
                }
                tokio::task::yield_now().await;
            }
            panic!("write queue never filled");
        })
        .await
        .expect("submit must not wait on a stalled peer");

        let (accepted, err) = outcome;
        assert!(accepted >= RpcConfig::WRITE_QUEUE_DEPTH);
        assert!(
            matches!(err, MeshError::Overloaded { ref destination } if destination == addr.as_str()),
            "expected Overloaded, got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        drop(listener);

        let result = PeerConnection::connect(&addr, RpcConfig::CONNECT_TIMEOUT, MAX).await;
        assert!(result.is_err());
    }
}
