// src/common/config.rs

//! Process configuration files (JSON).

use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use crate::common::error::{KvError, Result};
use crate::topology::{ClusterRing, StoreNode};

/// Default capacity of each client's notification channel on the master
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 3;

fn load<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| KvError::InvalidConfiguration(format!("Failed to read {} config file: {}", what, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| KvError::InvalidConfiguration(format!("Failed to parse {} config file: {}", what, e)))
}

fn save<T: Serialize>(value: &T, path: &Path, what: &str) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| KvError::Internal(format!("Failed to serialize {} config: {}", what, e)))?;
    fs::write(path, content)?;
    Ok(())
}

/// A store serving one replica of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAssignment {
    pub shard_id: u32,
    #[serde(default)]
    pub replica: usize,
    pub node: StoreNode,
}

/// A keyspace as configured on the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceConfig {
    pub keyspace: String,
    pub data_center: String,
    pub cluster_size: u32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    #[serde(default)]
    pub stores: Vec<StoreAssignment>,
}

fn default_replication_factor() -> u32 {
    1
}

impl KeyspaceConfig {
    /// Build the initial ring of this keyspace
    pub fn to_ring(&self) -> Result<ClusterRing> {
        let mut ring = ClusterRing::new(
            self.keyspace.clone(),
            self.data_center.clone(),
            self.cluster_size,
            self.replication_factor,
        )?;
        for store in &self.stores {
            ring = ring.with_node(store.shard_id, store.replica, store.node.clone())?;
        }
        Ok(ring)
    }
}

/// Configuration for the master process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address clients register on
    pub listen_addr: String,
    /// Capacity of each client's notification channel
    pub client_channel_capacity: usize,
    /// Keyspaces known at startup
    pub keyspaces: Vec<KeyspaceConfig>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8278".to_string(),
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
            keyspaces: Vec::new(),
        }
    }
}

impl MasterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load(path.as_ref(), "master")
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save(self, path.as_ref(), "master")
    }
}

/// A shard hosted by a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub keyspace: String,
    pub shard_id: u32,
    pub cluster_size: u32,
}

/// Configuration for a store process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Address clients and peers connect to
    pub listen_addr: String,
    pub data_center: String,
    pub shards: Vec<ShardConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8279".to_string(),
            data_center: "dc1".to_string(),
            shards: Vec::new(),
        }
    }
}

impl StoreConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load(path.as_ref(), "store")
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save(self, path.as_ref(), "store")
    }
}

/// Configuration for a client process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub master_addr: String,
    pub data_center: String,
    /// Maximum connections per store node
    pub max_connections: usize,
    /// Maximum time to wait for a pooled connection (in seconds)
    pub acquire_timeout: u64,
    /// Timeout of one round-trip (in seconds)
    pub operation_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:8278".to_string(),
            data_center: "dc1".to_string(),
            max_connections: 10,
            acquire_timeout: 30,
            operation_timeout: 60,
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load(path.as_ref(), "client")
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_master_config_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.json");
        let config = MasterConfig {
            keyspaces: vec![KeyspaceConfig {
                keyspace: "users".to_string(),
                data_center: "dc1".to_string(),
                cluster_size: 2,
                replication_factor: 1,
                stores: vec![StoreAssignment {
                    shard_id: 1,
                    replica: 0,
                    node: StoreNode::new("s1", "127.0.0.1:9001"),
                }],
            }],
            ..MasterConfig::default()
        };
        config.to_file(&path).unwrap();

        let loaded = MasterConfig::from_file(&path).unwrap();
        assert_eq!(loaded.client_channel_capacity, DEFAULT_CLIENT_CHANNEL_CAPACITY);
        let ring = loaded.keyspaces[0].to_ring().unwrap();
        assert_eq!(ring.cluster_size(), 2);
        assert_eq!(ring.shard_nodes(1).unwrap()[0].as_ref().unwrap().address, "127.0.0.1:9001");
    }

    #[test]
    fn test_partial_store_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, r#"{"shards":[{"keyspace":"ks","shard_id":0,"cluster_size":1}]}"#).unwrap();
        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.data_center, "dc1");
        assert_eq!(config.shards.len(), 1);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let result = ClientConfig::from_file("/definitely/not/here.json");
        assert!(matches!(result, Err(KvError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_invalid_keyspace_config() {
        let config = KeyspaceConfig {
            keyspace: "ks".to_string(),
            data_center: "dc1".to_string(),
            cluster_size: 0,
            replication_factor: 1,
            stores: Vec::new(),
        };
        assert!(matches!(config.to_ring(), Err(KvError::InvalidConfiguration(_))));
    }
}
