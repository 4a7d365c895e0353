// src/client/listener.rs

//! Client-side cache of cluster rings, kept fresh by the master's pushes.

use futures::future::{self, Either};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};
use crate::common::error::{KvError, Result};
use crate::protocol::{ClientHeartbeat, ClientMessage, StoreResource};
use crate::topology::{AccessOption, ClusterRing};
use crate::transport::tcp::{connect_master, ConnectionOptions};
use crate::transport::{ConnectionProvider, MessageSink, MessageSource, StoreConnection};

/// Delay between reconnection attempts to the master.
#[derive(Debug, Clone)]
pub enum ReconnectBackoff {
    /// Fixed delay between reconnection attempts.
    Fixed(Duration),
    /// Exponentially increasing delay with a maximum value.
    Exponential {
        /// Initial backoff duration.
        initial: Duration,
        /// Maximum backoff duration.
        max: Duration,
        /// Multiplier for each step.
        multiplier: f64,
    },
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl ReconnectBackoff {
    /// Calculate the backoff duration for a given attempt.
    pub fn duration_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(duration) => *duration,
            Self::Exponential { initial, max, multiplier } => {
                let millis = initial.as_millis() as f64 * multiplier.powf(attempt as f64);
                let millis = millis.min(max.as_millis() as f64) as u64;
                Duration::from_millis(millis)
            }
        }
    }
}

/// A resize announced by the master but not yet committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingResize {
    pub current_cluster_size: u32,
    pub next_cluster_size: u32,
}

/// Holds the latest ring of every keyspace this client uses
pub struct ClusterListener {
    data_center: String,
    clusters: RwLock<HashMap<String, Arc<ClusterRing>>>,
    resizes: RwLock<HashMap<String, PendingResize>>,
    keyspaces: Mutex<HashSet<String>>,
    keyspace_tx: mpsc::UnboundedSender<String>,
    /// Held by the active registration for its whole lifetime
    keyspace_rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    updated: Notify,
    connector: Arc<dyn ConnectionProvider>,
}

impl ClusterListener {
    pub fn new(data_center: impl Into<String>, connector: Arc<dyn ConnectionProvider>) -> Self {
        let (keyspace_tx, keyspace_rx) = mpsc::unbounded_channel();
        Self {
            data_center: data_center.into(),
            clusters: RwLock::new(HashMap::new()),
            resizes: RwLock::new(HashMap::new()),
            keyspaces: Mutex::new(HashSet::new()),
            keyspace_tx,
            keyspace_rx: AsyncMutex::new(keyspace_rx),
            updated: Notify::new(),
            connector,
        }
    }

    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    /// The cached ring of a keyspace, if one was received
    pub fn get_cluster(&self, keyspace: &str) -> Option<Arc<ClusterRing>> {
        let clusters = self.clusters.read().unwrap_or_else(|e| e.into_inner());
        clusters.get(keyspace).cloned()
    }

    /// The resize announced for a keyspace and not yet committed, if any
    pub fn pending_resize(&self, keyspace: &str) -> Option<PendingResize> {
        let resizes = self.resizes.read().unwrap_or_else(|e| e.into_inner());
        resizes.get(keyspace).copied()
    }

    /// Subscribe to a keyspace. Returns false if it was already known.
    pub fn add_new_keyspace(&self, keyspace: &str) -> bool {
        let mut keyspaces = self.keyspaces.lock().unwrap_or_else(|e| e.into_inner());
        if !keyspaces.insert(keyspace.to_string()) {
            return false;
        }
        debug!("subscribing to keyspace '{}'", keyspace);
        // The receiver lives as long as `self`.
        let _ = self.keyspace_tx.send(keyspace.to_string());
        true
    }

    fn known_keyspaces(&self) -> Vec<String> {
        let keyspaces = self.keyspaces.lock().unwrap_or_else(|e| e.into_inner());
        let mut known: Vec<String> = keyspaces.iter().cloned().collect();
        known.sort();
        known
    }

    /// Wait until a ring of `keyspace` is cached
    pub async fn wait_for_cluster(&self, keyspace: &str, wait: Duration) -> Result<Arc<ClusterRing>> {
        let deadline = Instant::now() + wait;
        loop {
            let updated = self.updated.notified();
            if let Some(ring) = self.get_cluster(keyspace) {
                return Ok(ring);
            }
            if timeout_at(deadline, updated).await.is_err() {
                return Err(KvError::KeyspaceNotFound(keyspace.to_string()));
            }
        }
    }

    /// Lease a connection to the node serving `shard_id` of `keyspace`.
    ///
    /// Returns the connection and the replica index it serves.
    pub async fn get_connection_by_shard_id(
        &self,
        keyspace: &str,
        shard_id: u32,
        options: &[AccessOption],
    ) -> Result<(Box<dyn StoreConnection>, usize)> {
        let ring = self
            .get_cluster(keyspace)
            .ok_or_else(|| KvError::KeyspaceNotFound(keyspace.to_string()))?;
        self.get_connection_in_ring(&ring, shard_id, options).await
    }

    /// Same as [`get_connection_by_shard_id`](Self::get_connection_by_shard_id)
    /// against a ring the caller already holds
    pub async fn get_connection_in_ring(
        &self,
        ring: &ClusterRing,
        shard_id: u32,
        options: &[AccessOption],
    ) -> Result<(Box<dyn StoreConnection>, usize)> {
        let (node, replica) = ring.node_for_shard(shard_id, options)?;
        let connection = self.connector.get_connection(node).await?;
        Ok((connection, replica))
    }

    fn store_ring(&self, ring: ClusterRing) {
        let keyspace = ring.keyspace().to_string();
        {
            let mut resizes = self.resizes.write().unwrap_or_else(|e| e.into_inner());
            if resizes.get(&keyspace).is_some_and(|r| r.next_cluster_size == ring.cluster_size()) {
                resizes.remove(&keyspace);
            }
        }
        let mut clusters = self.clusters.write().unwrap_or_else(|e| e.into_inner());
        clusters.insert(keyspace, Arc::new(ring));
    }

    fn apply_store_update(&self, store: &StoreResource, is_delete: bool) -> Result<()> {
        let Some(ring) = self.get_cluster(&store.keyspace) else {
            debug!("store update for unsubscribed keyspace '{}'", store.keyspace);
            return Ok(());
        };
        let next = if is_delete {
            ring.without_node(store.shard_id, store.replica)?
        } else {
            ring.with_node(store.shard_id, store.replica, store.node.clone())?
        };
        self.store_ring(next);
        Ok(())
    }

    /// Apply one push from the master to the cache
    pub fn apply_message(&self, msg: ClientMessage) {
        match msg {
            ClientMessage::Cluster(ring) => {
                info!(
                    "keyspace '{}' ring: {} shards x {} replicas",
                    ring.keyspace(), ring.cluster_size(), ring.replication_factor()
                );
                self.store_ring(ring);
            }
            ClientMessage::Resize { keyspace, current_cluster_size, next_cluster_size } => {
                info!("keyspace '{}' resizing {} -> {}", keyspace, current_cluster_size, next_cluster_size);
                let mut resizes = self.resizes.write().unwrap_or_else(|e| e.into_inner());
                resizes.insert(keyspace, PendingResize { current_cluster_size, next_cluster_size });
            }
            ClientMessage::StoreResourceUpdate { stores, is_delete } => {
                for store in &stores {
                    if let Err(e) = self.apply_store_update(store, is_delete) {
                        warn!("ignoring store update {:?}: {}", store, e);
                    }
                }
            }
        }
        self.updated.notify_waiters();
    }

    /// Run one registration stream with the master.
    ///
    /// Heartbeats for every known keyspace are replayed first, then each
    /// newly added keyspace is sent as it appears. Incoming messages are
    /// applied concurrently. Returns `Ok` when the master ends the stream.
    pub async fn register_at_master<K, M>(&self, mut heartbeats: K, mut messages: M) -> Result<()>
    where
        K: MessageSink<ClientHeartbeat>,
        M: MessageSource<ClientMessage>,
    {
        let mut new_keyspaces = self.keyspace_rx.lock().await;
        while new_keyspaces.try_recv().is_ok() {}
        let replay = self.known_keyspaces();
        let data_center = self.data_center.clone();

        let send = async move {
            for keyspace in replay {
                heartbeats.send(ClientHeartbeat { keyspace, data_center: data_center.clone() }).await?;
            }
            while let Some(keyspace) = new_keyspaces.recv().await {
                heartbeats.send(ClientHeartbeat { keyspace, data_center: data_center.clone() }).await?;
            }
            Ok::<(), KvError>(())
        };

        let receive = async move {
            while let Some(msg) = messages.recv().await? {
                self.apply_message(msg);
            }
            Ok::<(), KvError>(())
        };

        futures::pin_mut!(send, receive);
        match future::select(send, receive).await {
            Either::Left((Ok(()), receive)) => receive.await,
            Either::Left((Err(e), _)) => Err(e),
            Either::Right((result, _)) => result,
        }
    }

    /// Stay registered at a master over TCP, reconnecting with `backoff`
    /// whenever the stream ends. Never returns.
    pub async fn run(&self, master_addr: &str, options: ConnectionOptions, backoff: ReconnectBackoff) {
        let mut attempt = 0;
        loop {
            match connect_master(master_addr, &options).await {
                Ok((heartbeats, messages)) => {
                    info!("registered at master {}", master_addr);
                    attempt = 0;
                    match self.register_at_master(heartbeats, messages).await {
                        Ok(()) => info!("master {} closed the stream", master_addr),
                        Err(e) => warn!("stream to master {} failed: {}", master_addr, e),
                    }
                }
                Err(e) => warn!("cannot reach master {}: {}", master_addr, e),
            }
            let delay = backoff.duration_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StoreResource;
    use crate::store::StoreServer;
    use crate::topology::StoreNode;
    use crate::transport::local::LocalConnector;

    fn ring(size: u32) -> ClusterRing {
        let mut ring = ClusterRing::new("ks", "dc1", size, 1).unwrap();
        for shard in 0..size {
            ring = ring
                .with_node(shard, 0, StoreNode::new(format!("s{}", shard), format!("store-{}", shard)))
                .unwrap();
        }
        ring
    }

    fn listener(connector: Arc<LocalConnector>) -> Arc<ClusterListener> {
        Arc::new(ClusterListener::new("dc1", connector))
    }

    #[test]
    fn test_apply_messages() {
        let listener = listener(Arc::new(LocalConnector::new()));
        assert!(listener.get_cluster("ks").is_none());

        listener.apply_message(ClientMessage::Cluster(ring(2)));
        assert_eq!(listener.get_cluster("ks").unwrap().cluster_size(), 2);

        listener.apply_message(ClientMessage::Resize {
            keyspace: "ks".to_string(),
            current_cluster_size: 2,
            next_cluster_size: 3,
        });
        assert_eq!(
            listener.pending_resize("ks"),
            Some(PendingResize { current_cluster_size: 2, next_cluster_size: 3 })
        );

        listener.apply_message(ClientMessage::StoreResourceUpdate {
            stores: vec![StoreResource {
                keyspace: "ks".to_string(),
                shard_id: 1,
                replica: 0,
                node: StoreNode::new("s1", "store-1"),
            }],
            is_delete: true,
        });
        assert!(listener.get_cluster("ks").unwrap().shard_nodes(1).unwrap()[0].is_none());

        listener.apply_message(ClientMessage::Cluster(ring(3)));
        assert_eq!(listener.get_cluster("ks").unwrap().cluster_size(), 3);
        assert!(listener.pending_resize("ks").is_none());
    }

    #[test]
    fn test_add_new_keyspace_once() {
        let listener = listener(Arc::new(LocalConnector::new()));
        assert!(listener.add_new_keyspace("a"));
        assert!(!listener.add_new_keyspace("a"));
        assert!(listener.add_new_keyspace("b"));
        assert_eq!(listener.known_keyspaces(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_get_connection_by_shard_id() {
        let connector = Arc::new(LocalConnector::new());
        connector.register("store-0", Arc::new(StoreServer::new("dc1")));
        let listener = listener(Arc::clone(&connector));

        assert!(matches!(
            listener.get_connection_by_shard_id("ks", 0, &[]).await,
            Err(KvError::KeyspaceNotFound(_))
        ));

        listener.apply_message(ClientMessage::Cluster(ring(2)));
        let (conn, replica) = listener.get_connection_by_shard_id("ks", 0, &[]).await.unwrap();
        assert_eq!(replica, 0);
        conn.close().await.unwrap();

        // store-1 is in the ring but unreachable.
        assert!(matches!(
            listener.get_connection_by_shard_id("ks", 1, &[]).await,
            Err(KvError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_register_replays_then_forwards() {
        let listener = listener(Arc::new(LocalConnector::new()));
        listener.add_new_keyspace("ks");

        let (hb_tx, mut hb_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let session = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.register_at_master(hb_tx, msg_rx).await })
        };

        let first = hb_rx.recv().await.unwrap();
        assert_eq!(first, ClientHeartbeat { keyspace: "ks".to_string(), data_center: "dc1".to_string() });

        listener.add_new_keyspace("other");
        assert_eq!(hb_rx.recv().await.unwrap().keyspace, "other");

        msg_tx.send(ClientMessage::Cluster(ring(2))).unwrap();
        let ring = listener.wait_for_cluster("ks", Duration::from_secs(5)).await.unwrap();
        assert_eq!(ring.cluster_size(), 2);

        drop(msg_tx);
        session.await.unwrap().unwrap();

        // A second registration replays both keyspaces.
        let (hb_tx, mut hb_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel::<ClientMessage>();
        drop(msg_tx);
        listener.register_at_master(hb_tx, msg_rx).await.unwrap();
        let mut replayed = Vec::new();
        while let Ok(hb) = hb_rx.try_recv() {
            replayed.push(hb.keyspace);
        }
        assert!(replayed.contains(&"ks".to_string()));
        assert!(replayed.contains(&"other".to_string()));
    }

    #[tokio::test]
    async fn test_wait_for_cluster_times_out() {
        let listener = listener(Arc::new(LocalConnector::new()));
        let result = listener.wait_for_cluster("ks", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(KvError::KeyspaceNotFound(_))));
    }

    #[test]
    fn test_backoff() {
        let backoff = ReconnectBackoff::default();
        assert_eq!(backoff.duration_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.duration_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.duration_for_attempt(20), Duration::from_secs(5));
        assert_eq!(ReconnectBackoff::Fixed(Duration::from_secs(1)).duration_for_attempt(7), Duration::from_secs(1));
    }
}
