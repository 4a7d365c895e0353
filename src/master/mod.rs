// src/master/mod.rs

//! Master: owns the published topology and pushes changes to clients.

pub mod channels;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use crate::common::config::{KeyspaceConfig, MasterConfig, StoreAssignment};
use crate::common::error::{KvError, Result};
use crate::protocol::{ClientHeartbeat, ClientMessage, StoreResource};
use crate::topology::{ClusterRing, StoreNode};
use crate::transport::{MessageSink, MessageSource};

pub use channels::ClientChannels;

type RingKey = (String, String);

/// The master node
pub struct MasterServer {
    /// (keyspace, data center) -> current ring
    topology: RwLock<HashMap<RingKey, Arc<ClusterRing>>>,
    /// Held from publish through broadcast so clients see changes in
    /// publish order
    mutations: Mutex<()>,
    channels: ClientChannels,
}

impl MasterServer {
    pub fn new(client_channel_capacity: usize) -> Self {
        Self {
            topology: RwLock::new(HashMap::new()),
            mutations: Mutex::new(()),
            channels: ClientChannels::new(client_channel_capacity),
        }
    }

    /// Create a master publishing every configured keyspace
    pub fn from_config(config: &MasterConfig) -> Result<Self> {
        let master = Self::new(config.client_channel_capacity);
        for keyspace in &config.keyspaces {
            master.create_keyspace(keyspace)?;
        }
        Ok(master)
    }

    pub fn channels(&self) -> &ClientChannels {
        &self.channels
    }

    pub fn get_ring(&self, keyspace: &str, data_center: &str) -> Option<Arc<ClusterRing>> {
        let topology = self.topology.read().ok()?;
        topology.get(&(keyspace.to_string(), data_center.to_string())).cloned()
    }

    /// Replace a keyspace's ring with `change(current)` under one write guard
    fn update_ring<T>(
        &self,
        keyspace: &str,
        data_center: &str,
        change: impl FnOnce(&ClusterRing) -> Result<(ClusterRing, T)>,
    ) -> Result<(Arc<ClusterRing>, T)> {
        let key = (keyspace.to_string(), data_center.to_string());
        let mut topology = self.topology.write().map_err(|_| poisoned())?;
        let current = topology
            .get(&key)
            .ok_or_else(|| KvError::KeyspaceNotFound(format!("{} in {}", keyspace, data_center)))?;
        let (next, extra) = change(current)?;
        let next = Arc::new(next);
        topology.insert(key, Arc::clone(&next));
        Ok((next, extra))
    }

    /// Start publishing a keyspace
    pub fn create_keyspace(&self, config: &KeyspaceConfig) -> Result<Arc<ClusterRing>> {
        let ring = Arc::new(config.to_ring()?);
        let key = (config.keyspace.clone(), config.data_center.clone());
        let mut topology = self.topology.write().map_err(|_| poisoned())?;
        match topology.entry(key) {
            Entry::Occupied(_) => {
                return Err(KvError::InvalidConfiguration(format!(
                    "keyspace '{}' already exists in {}",
                    config.keyspace, config.data_center
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&ring));
            }
        }
        info!(
            "keyspace '{}' in {} with {} shards x {} replicas",
            ring.keyspace(), ring.data_center(), ring.cluster_size(), ring.replication_factor()
        );
        Ok(ring)
    }

    /// Place a store in a replica slot and tell the data center's clients
    pub async fn assign_store(
        &self,
        keyspace: &str,
        data_center: &str,
        shard_id: u32,
        replica: usize,
        node: StoreNode,
    ) -> Result<()> {
        let _mutation = self.mutations.lock().await;
        self.update_ring(keyspace, data_center, |ring| {
            Ok((ring.with_node(shard_id, replica, node.clone())?, ()))
        })?;
        info!("store {} serves keyspace '{}' shard {} replica {}", node.address, keyspace, shard_id, replica);

        let store = StoreResource { keyspace: keyspace.to_string(), shard_id, replica, node };
        self.broadcast(data_center, self.channels.notify_store_resource_update(data_center, vec![store], false).await);
        Ok(())
    }

    /// Empty a replica slot and tell the data center's clients
    pub async fn remove_store(&self, keyspace: &str, data_center: &str, shard_id: u32, replica: usize) -> Result<()> {
        let _mutation = self.mutations.lock().await;
        let (_, node) = self.update_ring(keyspace, data_center, |ring| {
            let node = ring
                .shard_nodes(shard_id)
                .and_then(|slots| slots.get(replica).cloned().flatten())
                .ok_or_else(|| {
                    KvError::InvalidConfiguration(format!(
                        "keyspace '{}' shard {} replica {} has no store",
                        keyspace, shard_id, replica
                    ))
                })?;
            Ok((ring.without_node(shard_id, replica)?, node))
        })?;
        info!("store {} left keyspace '{}' shard {} replica {}", node.address, keyspace, shard_id, replica);

        let store = StoreResource { keyspace: keyspace.to_string(), shard_id, replica, node };
        self.broadcast(data_center, self.channels.notify_store_resource_update(data_center, vec![store], true).await);
        Ok(())
    }

    /// Announce that a keyspace is about to change size.
    ///
    /// Resizes of one keyspace must not overlap; callers serialize them.
    pub async fn begin_resize(&self, keyspace: &str, data_center: &str, next_cluster_size: u32) -> Result<()> {
        ClusterRing::check_sizes(keyspace, next_cluster_size, 1)?;
        let _mutation = self.mutations.lock().await;
        let current = self
            .get_ring(keyspace, data_center)
            .ok_or_else(|| KvError::KeyspaceNotFound(format!("{} in {}", keyspace, data_center)))?;
        info!(
            "resizing keyspace '{}' in {} from {} to {}",
            keyspace, data_center, current.cluster_size(), next_cluster_size
        );
        self.channels
            .notify_cluster_size(data_center, keyspace, current.cluster_size(), next_cluster_size)
            .await
    }

    /// Publish the resized ring and push it to every client of the data center
    pub async fn commit_resize(
        &self,
        keyspace: &str,
        data_center: &str,
        next_cluster_size: u32,
        stores: &[StoreAssignment],
    ) -> Result<Arc<ClusterRing>> {
        let _mutation = self.mutations.lock().await;
        let (ring, ()) = self.update_ring(keyspace, data_center, |current| {
            let config = KeyspaceConfig {
                keyspace: keyspace.to_string(),
                data_center: data_center.to_string(),
                cluster_size: next_cluster_size,
                replication_factor: current.replication_factor(),
                stores: stores.to_vec(),
            };
            Ok((config.to_ring()?, ()))
        })?;
        info!("keyspace '{}' in {} now has {} shards", keyspace, data_center, next_cluster_size);

        self.broadcast(
            data_center,
            self.channels.notify_clients(data_center, ClientMessage::Cluster(ring.as_ref().clone())).await,
        );
        Ok(ring)
    }

    /// The topology change is already published; a client that vanished
    /// mid-broadcast re-reads the ring on its next registration.
    fn broadcast(&self, data_center: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!("broadcast to {} incomplete: {}", data_center, e);
        }
    }

    /// Serve one client registration stream.
    ///
    /// The first heartbeat names the client's data center. Each heartbeat
    /// for a known keyspace is answered with that keyspace's ring; every
    /// broadcast for the data center is forwarded to `sink` until the
    /// heartbeat stream ends.
    pub async fn run_client_session<H, K>(&self, server: &str, mut heartbeats: H, mut sink: K) -> Result<()>
    where
        H: MessageSource<ClientHeartbeat>,
        K: MessageSink<ClientMessage> + 'static,
    {
        let Some(first) = heartbeats.recv().await? else {
            return Ok(());
        };
        let data_center = first.data_center.clone();
        let mut outbound = self.channels.add_client(&data_center, server).await?;
        info!("client {} registered from {}", server, data_center);

        let forward = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                sink.send(msg).await?;
            }
            Ok::<(), KvError>(())
        });

        let mut result = self.answer_heartbeat(&data_center, server, first).await;
        while result.is_ok() {
            match heartbeats.recv().await {
                Ok(Some(heartbeat)) => result = self.answer_heartbeat(&data_center, server, heartbeat).await,
                Ok(None) => break,
                Err(e) => result = Err(e),
            }
        }

        if let Err(e) = self.channels.remove_client(&data_center, server).await {
            debug!("client {} already gone: {}", server, e);
        }
        match forward.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("client {} stream ended: {}", server, e),
            Err(e) => warn!("client {} forwarder failed: {}", server, e),
        }
        info!("client {} from {} disconnected", server, data_center);
        result
    }

    async fn answer_heartbeat(&self, data_center: &str, server: &str, heartbeat: ClientHeartbeat) -> Result<()> {
        if heartbeat.data_center != data_center {
            warn!(
                "client {} registered in {} sent heartbeat for {}",
                server, data_center, heartbeat.data_center
            );
        }
        match self.get_ring(&heartbeat.keyspace, data_center) {
            Some(ring) => self.channels.send_client_cluster(data_center, server, &ring).await,
            None => {
                debug!("client {} asked for unknown keyspace '{}'", server, heartbeat.keyspace);
                Ok(())
            }
        }
    }
}

fn poisoned() -> KvError {
    KvError::Internal("master topology lock poisoned".to_string())
}
