// src/client/pool.rs

//! Connection pooling for store nodes.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;
use crate::common::config::ClientConfig;
use crate::common::error::{KvError, Result};
use crate::protocol::{BootstrapCopyRequest, BootstrapCopyResponse, Requests, Responses};
use crate::topology::StoreNode;
use crate::transport::tcp::{ConnectionOptions, TcpStoreConnection};
use crate::transport::{ConnectionProvider, MessageSink, StoreConnection};

/// Options for configuring a connection pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of connections in the pool.
    pub max_connections: usize,
    /// Maximum time to wait for a connection to become available.
    pub acquire_timeout: Duration,
    /// Maximum idle time for a connection before it's closed.
    pub max_idle_time: Option<Duration>,
    /// Connection options for creating new connections.
    pub connection_options: ConnectionOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            max_idle_time: Some(Duration::from_secs(60 * 30)), // 30 minutes
            connection_options: ConnectionOptions::default(),
        }
    }
}

impl From<&ClientConfig> for PoolOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_connections: config.max_connections.max(1),
            acquire_timeout: config.acquire_timeout(),
            connection_options: ConnectionOptions {
                operation_timeout: config.operation_timeout(),
                ..ConnectionOptions::default()
            },
            ..Self::default()
        }
    }
}

/// An idle connection with metadata.
struct IdleConnection {
    connection: TcpStoreConnection,
    last_used_at: Instant,
}

/// A connection pool for one store address.
#[derive(Clone)]
pub struct ConnectionPool {
    /// Store address.
    address: String,
    options: PoolOptions,
    /// Idle connections, oldest first.
    available: Arc<Mutex<VecDeque<IdleConnection>>>,
    /// One permit per leased connection.
    semaphore: Arc<Semaphore>,
}

impl ConnectionPool {
    pub fn new(address: impl Into<String>, options: PoolOptions) -> Self {
        let semaphore = Arc::new(Semaphore::new(options.max_connections));
        let available = Arc::new(Mutex::new(VecDeque::with_capacity(options.max_connections)));
        Self {
            address: address.into(),
            options,
            available,
            semaphore,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of idle connections
    pub async fn idle_count(&self) -> usize {
        self.available.lock().await.len()
    }

    /// Lease a connection, reusing an idle one when possible.
    pub async fn get(&self) -> Result<PooledConnection> {
        let permit = match timeout(self.options.acquire_timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => return Err(KvError::Connection(format!("pool for {} is closed: {}", self.address, e))),
            Err(_) => {
                return Err(KvError::Connection(format!(
                    "no connection to {} available after {:?}",
                    self.address, self.options.acquire_timeout
                )))
            }
        };

        let idle = {
            let mut available = self.available.lock().await;
            if let Some(max_idle) = self.options.max_idle_time {
                let now = Instant::now();
                while available.front().is_some_and(|c| now.duration_since(c.last_used_at) > max_idle) {
                    available.pop_front();
                }
            }
            available.pop_back()
        };

        let connection = match idle {
            Some(idle) => idle.connection,
            None => {
                debug!("opening new connection to {}", self.address);
                TcpStoreConnection::connect(&self.address, self.options.connection_options.clone()).await?
            }
        };

        Ok(PooledConnection {
            connection: Some(connection),
            pool: self.clone(),
            broken: false,
            _permit: permit,
        })
    }

    async fn return_connection(&self, connection: TcpStoreConnection) {
        let mut available = self.available.lock().await;
        available.push_back(IdleConnection { connection, last_used_at: Instant::now() });
    }

    /// Drop every idle connection and refuse new leases.
    pub async fn close(&self) {
        self.semaphore.close();
        self.available.lock().await.clear();
    }
}

/// A leased connection. `close` hands it back to its pool; dropping it
/// discards the connection.
pub struct PooledConnection {
    connection: Option<TcpStoreConnection>,
    pool: ConnectionPool,
    /// Set after a failed round-trip; the stream may hold a stale reply
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn inner(&mut self) -> Result<&mut TcpStoreConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| KvError::Internal("pooled connection already released".to_string()))
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

#[async_trait]
impl StoreConnection for PooledConnection {
    async fn send_requests(&mut self, requests: Requests) -> Result<Responses> {
        let result = self.inner()?.send_requests(requests).await;
        self.track(result)
    }

    async fn bootstrap_copy(
        &mut self,
        request: BootstrapCopyRequest,
        sink: &mut dyn MessageSink<BootstrapCopyResponse>,
    ) -> Result<()> {
        let result = self.inner()?.bootstrap_copy(request, sink).await;
        self.track(result)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let Some(connection) = this.connection.take() else {
            return Ok(());
        };
        if this.broken {
            debug!("discarding broken connection to {}", this.pool.address);
            return Box::new(connection).close().await;
        }
        this.pool.return_connection(connection).await;
        Ok(())
    }
}

/// One pool per store address
pub struct NodePools {
    options: PoolOptions,
    pools: RwLock<HashMap<String, ConnectionPool>>,
}

impl NodePools {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            pools: RwLock::new(HashMap::new()),
        }
    }

    fn pool_for(&self, address: &str) -> ConnectionPool {
        if let Some(pool) = self.pools.read().unwrap_or_else(|e| e.into_inner()).get(address) {
            return pool.clone();
        }
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        pools
            .entry(address.to_string())
            .or_insert_with(|| ConnectionPool::new(address, self.options.clone()))
            .clone()
    }

    /// Close every pool.
    pub async fn close(&self) {
        let pools: Vec<ConnectionPool> = {
            let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.close().await;
        }
    }
}

#[async_trait]
impl ConnectionProvider for NodePools {
    async fn get_connection(&self, node: &StoreNode) -> Result<Box<dyn StoreConnection>> {
        let pool = self.pool_for(&node.address);
        Ok(Box::new(pool.get().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listening_address() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, address)
    }

    fn options(max_connections: usize) -> PoolOptions {
        PoolOptions {
            max_connections,
            acquire_timeout: Duration::from_millis(100),
            ..PoolOptions::default()
        }
    }

    #[tokio::test]
    async fn test_connection_is_reused_after_close() {
        let (_listener, address) = listening_address().await;
        let pool = ConnectionPool::new(address, options(2));

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.idle_count().await, 0);
        Box::new(conn).close().await.unwrap();
        assert_eq!(pool.idle_count().await, 1);

        let _again = pool.get().await.unwrap();
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (_listener, address) = listening_address().await;
        let pool = ConnectionPool::new(address, options(1));

        let held = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(KvError::Connection(_))));

        drop(held);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_node_pools_share_pool_per_address() {
        let (_listener, address) = listening_address().await;
        let pools = NodePools::new(options(1));
        let node = StoreNode::new("s1", address.clone());

        let conn = pools.get_connection(&node).await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(pools.pool_for(&address).idle_count().await, 1);

        pools.close().await;
        assert_eq!(pools.pool_for(&address).idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_address() {
        let (listener, address) = listening_address().await;
        drop(listener);
        let pool = ConnectionPool::new(address, options(1));
        assert!(matches!(pool.get().await, Err(KvError::Connection(_))));
    }
}
