// src/store/mod.rs

//! Store node: hosts shards, serves keyed requests and bootstrap copies.

pub mod bootstrap;
pub mod shard;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use crate::common::config::StoreConfig;
use crate::common::error::{KvError, Result};
use crate::protocol::{BootstrapCopyRequest, BootstrapCopyResponse, Requests, Responses};
use crate::transport::MessageSink;

pub use bootstrap::{BOOTSTRAP_BATCH_SIZE, INTERNAL_PREFIX};
pub use shard::ShardInstance;

type ShardKey = (String, u32);

/// A store node
pub struct StoreServer {
    data_center: String,
    /// (keyspace, shard id) -> local shard
    shards: RwLock<HashMap<ShardKey, Arc<ShardInstance>>>,
}

impl StoreServer {
    pub fn new(data_center: impl Into<String>) -> Self {
        Self {
            data_center: data_center.into(),
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store with in-memory shards for every configured shard
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let server = Self::new(config.data_center.clone());
        for shard in &config.shards {
            server.add_shard(ShardInstance::in_memory(
                shard.keyspace.clone(),
                shard.shard_id,
                shard.cluster_size,
            )?)?;
        }
        Ok(server)
    }

    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    /// Host a shard. Fails if the same (keyspace, shard) is already hosted.
    pub fn add_shard(&self, shard: ShardInstance) -> Result<Arc<ShardInstance>> {
        let key = (shard.keyspace().to_string(), shard.id());
        let mut shards = self.shards.write().map_err(|_| poisoned())?;
        if shards.contains_key(&key) {
            return Err(KvError::InvalidConfiguration(format!(
                "keyspace '{}' shard {} already exists",
                key.0, key.1
            )));
        }
        let shard = Arc::new(shard);
        info!(
            "store hosts keyspace '{}' shard {} of {}",
            shard.keyspace(), shard.id(), shard.cluster_size()
        );
        shards.insert(key, Arc::clone(&shard));
        Ok(shard)
    }

    pub fn get_shard(&self, keyspace: &str, shard_id: u32) -> Option<Arc<ShardInstance>> {
        let shards = self.shards.read().ok()?;
        shards.get(&(keyspace.to_string(), shard_id)).cloned()
    }

    /// All local shards of a keyspace, ordered by shard id
    pub fn get_shards(&self, keyspace: &str) -> Vec<Arc<ShardInstance>> {
        let Ok(shards) = self.shards.read() else {
            return Vec::new();
        };
        let mut found: Vec<_> = shards
            .iter()
            .filter(|((ks, _), _)| ks == keyspace)
            .map(|(_, shard)| Arc::clone(shard))
            .collect();
        found.sort_by_key(|s| s.id());
        found
    }

    fn require_shard(&self, keyspace: &str, shard_id: u32) -> Result<Arc<ShardInstance>> {
        self.get_shard(keyspace, shard_id).ok_or_else(|| KvError::ShardNotFound {
            keyspace: keyspace.to_string(),
            shard_id,
        })
    }

    /// Apply a shard batch. Replies are positional with the requests.
    ///
    /// Every addressed shard must be hosted here, otherwise nothing is applied.
    pub async fn process_requests(&self, requests: Requests) -> Result<Responses> {
        let mut targets = Vec::with_capacity(requests.requests.len());
        for request in &requests.requests {
            targets.push(self.require_shard(&requests.keyspace, request.shard_id)?);
        }
        debug!(
            "processing {} requests for keyspace '{}'",
            requests.requests.len(), requests.keyspace
        );
        let responses = requests
            .requests
            .iter()
            .zip(targets)
            .map(|(request, shard)| shard.process(request))
            .collect();
        Ok(Responses { responses })
    }

    /// Stream a local shard to a new owner; see [`bootstrap::bootstrap_copy`]
    pub async fn bootstrap_copy(
        &self,
        request: BootstrapCopyRequest,
        sink: &mut dyn MessageSink<BootstrapCopyResponse>,
    ) -> Result<()> {
        info!("BootstrapCopy {:?}", request);
        let shard = self.require_shard(&request.keyspace, request.shard_id)?;
        bootstrap::bootstrap_copy(&shard, &request, sink).await
    }

    /// Close and destroy every local shard of a keyspace
    pub fn delete_keyspace(&self, keyspace: &str) -> Result<()> {
        let removed: Vec<Arc<ShardInstance>> = {
            let mut shards = self.shards.write().map_err(|_| poisoned())?;
            let keys: Vec<ShardKey> = shards.keys().filter(|(ks, _)| ks == keyspace).cloned().collect();
            keys.iter().filter_map(|k| shards.remove(k)).collect()
        };
        if removed.is_empty() {
            debug!("delete keyspace '{}': no local shards", keyspace);
            return Ok(());
        }
        for shard in &removed {
            if let Err(e) = shard.shutdown_and_destroy() {
                warn!("delete keyspace '{}' shard {}: {}", keyspace, shard.id(), e);
            }
        }
        info!("deleted keyspace '{}' ({} shards)", keyspace, removed.len());
        Ok(())
    }
}

fn poisoned() -> KvError {
    KvError::Internal("store shard map lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::ShardConfig;
    use crate::protocol::Request;
    use crate::transport::local::LocalCollector;

    fn store() -> StoreServer {
        let config = StoreConfig {
            shards: vec![
                ShardConfig { keyspace: "ks".to_string(), shard_id: 0, cluster_size: 2 },
                ShardConfig { keyspace: "ks".to_string(), shard_id: 1, cluster_size: 2 },
                ShardConfig { keyspace: "other".to_string(), shard_id: 0, cluster_size: 1 },
            ],
            ..StoreConfig::default()
        };
        StoreServer::from_config(&config).unwrap()
    }

    fn on_shard(mut request: Request, shard_id: u32) -> Request {
        request.shard_id = shard_id;
        request
    }

    #[tokio::test]
    async fn test_process_requests_positional() {
        let store = store();
        let responses = store
            .process_requests(Requests {
                keyspace: "ks".to_string(),
                requests: vec![
                    on_shard(Request::put(b"a".to_vec(), b"1".to_vec()), 0),
                    on_shard(Request::put(b"b".to_vec(), b"2".to_vec()), 0),
                    on_shard(Request::get(b"a".to_vec()), 0),
                    on_shard(Request::get(b"missing".to_vec()), 0),
                ],
            })
            .await
            .unwrap();
        assert_eq!(responses.responses.len(), 4);
        assert_eq!(responses.responses[2].key_value.as_ref().unwrap().value, b"1".to_vec());
        assert!(responses.responses[3].is_ok());
        assert!(responses.responses[3].key_value.is_none());
    }

    #[tokio::test]
    async fn test_unknown_shard_applies_nothing() {
        let store = store();
        let result = store
            .process_requests(Requests {
                keyspace: "ks".to_string(),
                requests: vec![
                    on_shard(Request::put(b"a".to_vec(), b"1".to_vec()), 0),
                    on_shard(Request::put(b"b".to_vec(), b"2".to_vec()), 7),
                ],
            })
            .await;
        assert!(matches!(result, Err(KvError::ShardNotFound { shard_id: 7, .. })));
        let shard = store.get_shard("ks", 0).unwrap();
        assert!(shard.db().get(b"a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_unknown_shard() {
        let store = store();
        let mut sink = LocalCollector::new();
        let result = store
            .bootstrap_copy(
                BootstrapCopyRequest {
                    keyspace: "nope".to_string(),
                    shard_id: 0,
                    target_shard_id: 0,
                    target_cluster_size: 0,
                },
                &mut sink,
            )
            .await;
        assert!(matches!(result, Err(KvError::ShardNotFound { .. })));
        assert!(sink.messages.is_empty());
    }

    #[test]
    fn test_duplicate_shard_rejected() {
        let store = store();
        let dup = ShardInstance::in_memory("ks", 1, 2).unwrap();
        assert!(matches!(store.add_shard(dup), Err(KvError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_delete_keyspace() {
        let store = store();
        let shard = store.get_shard("ks", 0).unwrap();
        shard.process(&Request::put(b"a".to_vec(), b"1".to_vec()));

        store.delete_keyspace("ks").unwrap();
        assert!(store.get_shards("ks").is_empty());
        assert_eq!(store.get_shards("other").len(), 1);
        assert!(shard.db().get(b"a").is_err());
        store.delete_keyspace("ks").unwrap();
    }
}
