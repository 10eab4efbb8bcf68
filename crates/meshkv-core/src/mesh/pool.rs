//! Lazily built pool of peer connections, one per destination.
//!
//! The map lock is held only to look up or update a destination's slot, never
//! across a dial. A destination being dialed holds the in-flight dial as a
//! shared future: every concurrent caller awaits that one attempt and sees its
//! outcome, success or failure. Calls for other destinations proceed untouched.
//!
//! A slot whose connection has closed is replaced on the next `get`, which
//! dials again. A failed dial is removed once it settles, so nothing is cached.

use super::connection::PeerConnection;
use crate::address::NodeAddress;
use crate::config::NodeConfig;
use crate::error::{MeshError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

type DialOutcome = std::result::Result<Arc<PeerConnection>, Arc<std::io::Error>>;
type Dial = Shared<BoxFuture<'static, DialOutcome>>;

enum Slot {
    Ready(Arc<PeerConnection>),
    Dialing(Dial),
}

#[derive(Default)]
struct Counters {
    dials: AtomicU64,
    dial_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Destinations with an established connection.
    pub cached: usize,
    /// Dial attempts made.
    pub dials: u64,
    /// Dial attempts that failed.
    pub dial_failures: u64,
    /// Closed connections dropped from the pool.
    pub evictions: u64,
}

/// Cache of reusable outbound connections keyed by destination address.
pub struct ConnectionPool {
    slots: Mutex<HashMap<NodeAddress, Slot>>,
    connect_timeout: Duration,
    max_message_size: usize,
    counters: Arc<Counters>,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration, max_message_size: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            connect_timeout,
            max_message_size,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.connect_timeout(), config.max_message_size)
    }

    /// Get the cached connection to `destination`, dialing it on first use.
    ///
    /// Callers arriving while a dial is in flight share its outcome; a failed
    /// dial fails all of them with `DialFailed` and is not retried.
    pub async fn get(&self, destination: &NodeAddress) -> Result<Arc<PeerConnection>> {
        let dial = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let in_flight = match slots.get(destination) {
                Some(Slot::Ready(conn)) if !conn.is_closed() => return Ok(conn.clone()),
                Some(Slot::Ready(_)) => {
                    info!("Evicting closed connection to {}", destination);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(Slot::Dialing(dial)) => Some(dial.clone()),
                None => None,
            };
            match in_flight {
                Some(dial) => dial,
                None => self.start_dial(&mut slots, destination),
            }
        };

        let outcome = dial.clone().await;
        self.settle(destination, &dial, &outcome);
        outcome.map_err(|source| MeshError::DialFailed {
            destination: destination.to_string(),
            source: std::io::Error::new(source.kind(), source.to_string()),
        })
    }

    /// Begin dialing `destination` and park the attempt in its slot.
    fn start_dial(&self, slots: &mut HashMap<NodeAddress, Slot>, destination: &NodeAddress) -> Dial {
        self.counters.dials.fetch_add(1, Ordering::Relaxed);
        debug!("Creating new connection to {}", destination);

        let counters = self.counters.clone();
        let target = destination.clone();
        let connect_timeout = self.connect_timeout;
        let max_message_size = self.max_message_size;
        let dial = async move {
            PeerConnection::connect(&target, connect_timeout, max_message_size)
                .await
                .map(Arc::new)
                .map_err(|e| {
                    counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                    Arc::new(e)
                })
        }
        .boxed()
        .shared();

        slots.insert(destination.clone(), Slot::Dialing(dial.clone()));
        dial
    }

    /// Replace a finished dial with its connection, or drop it if it failed.
    fn settle(&self, destination: &NodeAddress, dial: &Dial, outcome: &DialOutcome) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let still_dialing = matches!(
            slots.get(destination),
            Some(Slot::Dialing(current)) if current.ptr_eq(dial)
        );
        if !still_dialing {
            return;
        }
        match outcome {
            Ok(conn) => {
                slots.insert(destination.clone(), Slot::Ready(conn.clone()));
            }
            Err(e) => {
                debug!("Dial to {} failed: {}", destination, e);
                slots.remove(destination);
            }
        }
    }

    /// Number of destinations with an established connection.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            cached: self.len(),
            dials: self.counters.dials.load(Ordering::Relaxed),
            dial_failures: self.counters.dial_failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use std::time::Instant;
    use tokio::net::{TcpListener, TcpSocket, TcpStream};

    fn pool() -> ConnectionPool {
        ConnectionPool::new(RpcConfig::CONNECT_TIMEOUT, RpcConfig::MAX_MESSAGE_SIZE)
    }

    /// Listener that accepts and holds every connection.
    async fn holding_peer() -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_gets_share_one_connection() {
        let pool = Arc::new(pool());
        let addr = holding_peer().await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let addr = addr.clone();
            handles.push(tokio::spawn(async move { pool.get(&addr).await.unwrap() }));
        }

        let mut conns = Vec::new();
        for handle in handles {
            conns.push(handle.await.unwrap());
        }

        let first = &conns[0];
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, first)));
        let stats = pool.stats();
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.dials, 1);
    }

    #[tokio::test]
    async fn test_sequential_gets_reuse_connection() {
        let pool = pool();
        let addr = holding_peer().await;

        let a = pool.get(&addr).await.unwrap();
        let b = pool.get(&addr).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.stats().dials, 1);
    }

    #[tokio::test]
    async fn test_distinct_destinations_get_distinct_connections() {
        let pool = pool();
        let first = holding_peer().await;
        let second = holding_peer().await;

        let a = pool.get(&first).await.unwrap();
        let b = pool.get(&second).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_dial_failure_caches_nothing() {
        let pool = pool();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        drop(listener);

        let err = pool.get(&addr).await.unwrap_err();
        assert!(err.is_dial_failure());
        assert!(pool.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.dials, 1);
        assert_eq!(stats.dial_failures, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_evicted_and_redialed() {
        let pool = pool();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::parse(listener.local_addr().unwrap().to_string()).unwrap();
        tokio::spawn(async move {
            // First connection is closed right away, later ones are held.
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let first = pool.get(&addr).await.unwrap();
        for _ in 0..50 {
            if first.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(first.is_closed());

        let second = pool.get(&addr).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        let stats = pool.stats();
        assert_eq!(stats.dials, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.cached, 1);
    }

    /// Listener whose accept backlog is full, so further connects hang.
    struct BlackHole {
        addr: NodeAddress,
        _listener: TcpListener,
        _fillers: Vec<TcpStream>,
    }

    async fn black_hole() -> BlackHole {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let local = listener.local_addr().unwrap();

        let mut fillers = Vec::new();
        for _ in 0..8 {
            let connect = TcpStream::connect(local);
            if let Ok(Ok(stream)) = tokio::time::timeout(Duration::from_millis(100), connect).await {
                fillers.push(stream);
            }
        }

        BlackHole {
            addr: NodeAddress::parse(local.to_string()).unwrap(),
            _listener: listener,
            _fillers: fillers,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_failed_dial() {
        let connect_timeout = Duration::from_millis(300);
        let pool = Arc::new(ConnectionPool::new(connect_timeout, RpcConfig::MAX_MESSAGE_SIZE));
        let hole = black_hole().await;

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let pool = pool.clone();
            let addr = hole.addr.clone();
            handles.push(tokio::spawn(async move { pool.get(&addr).await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_dial_failure(), "expected DialFailed, got {:?}", err);
        }

        assert!(start.elapsed() < connect_timeout * 2);
        let stats = pool.stats();
        assert_eq!(stats.dials, 1);
        assert_eq!(stats.dial_failures, 1);
        assert!(pool.is_empty());
    }
}
