// src/store/shard.rs

//! One shard hosted by a store node.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use crate::common::error::{KvError, Result};
use crate::protocol::{KeyValue, LogPosition, Operation, Request, Response};
use crate::storage::codec::Entry;
use crate::storage::{Database, LogManager, MemoryDatabase, MemoryLog};

/// A local shard: its data store plus its write log
pub struct ShardInstance {
    keyspace: String,
    id: u32,
    cluster_size: u32,
    db: Arc<dyn Database>,
    lm: Arc<dyn LogManager>,
    /// Serializes writes against fencing so a write lands either before
    /// the fence (and in the snapshot) or after it (and only in the log).
    write_lock: Mutex<()>,
}

impl ShardInstance {
    pub fn new(
        keyspace: impl Into<String>,
        id: u32,
        cluster_size: u32,
        db: Arc<dyn Database>,
        lm: Arc<dyn LogManager>,
    ) -> Result<Self> {
        let keyspace = keyspace.into();
        if cluster_size == 0 || id >= cluster_size {
            return Err(KvError::InvalidConfiguration(format!(
                "keyspace '{}': shard {} does not fit cluster size {}",
                keyspace, id, cluster_size
            )));
        }
        Ok(Self { keyspace, id, cluster_size, db, lm, write_lock: Mutex::new(()) })
    }

    /// A shard backed by the in-memory engine and log
    pub fn in_memory(keyspace: impl Into<String>, id: u32, cluster_size: u32) -> Result<Self> {
        let keyspace = keyspace.into();
        let db = Arc::new(MemoryDatabase::new(format!("{}/{}", keyspace, id)));
        Self::new(keyspace, id, cluster_size, db, Arc::new(MemoryLog::new()))
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn log(&self) -> &Arc<dyn LogManager> {
        &self.lm
    }

    /// Capture the current log position and a data snapshot atomically
    /// with respect to writes.
    pub fn fence(&self) -> Result<(LogPosition, Arc<dyn Database>)> {
        let _guard = self.write_lock.lock().map_err(|_| self.poisoned())?;
        let position = self.lm.segment_offset();
        let snapshot = self.db.snapshot()?;
        Ok((position, snapshot))
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| self.poisoned())?;
        self.lm.append(key, value)?;
        match value {
            Some(value) => self.db.put(key, value),
            None => self.db.delete(key),
        }
    }

    /// Apply one request to this shard
    pub fn process(&self, request: &Request) -> Response {
        let result = match &request.operation {
            Operation::Get => self.get(&request.key),
            Operation::Put { value, ttl_second } => {
                let entry = Entry::new(request.partition_hash, *ttl_second, value.clone());
                self.write(&request.key, Some(&entry.to_bytes())).map(|_| None)
            }
            Operation::Delete => self.write(&request.key, None).map(|_| None),
        };
        match result {
            Ok(key_value) => Response::ok(key_value),
            Err(e) => {
                debug!("keyspace '{}' shard {}: request failed: {}", self.keyspace, self.id, e);
                Response::error(e.to_string())
            }
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        let Some(bytes) = self.db.get(key)? else {
            return Ok(None);
        };
        let entry = Entry::from_bytes(&bytes)?;
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        if entry.is_expired(now_ns) {
            return Ok(None);
        }
        Ok(Some(KeyValue::new(key.to_vec(), entry.value)))
    }

    /// Close the data store and drop its contents
    pub fn shutdown_and_destroy(&self) -> Result<()> {
        self.db.close()?;
        self.db.destroy()
    }

    fn poisoned(&self) -> KvError {
        KvError::Internal(format!("keyspace '{}' shard {}: write lock poisoned", self.keyspace, self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_must_fit_cluster() {
        assert!(ShardInstance::in_memory("ks", 4, 4).is_err());
        assert!(ShardInstance::in_memory("ks", 0, 0).is_err());
        assert!(ShardInstance::in_memory("ks", 3, 4).is_ok());
    }

    #[test]
    fn test_put_get_delete() {
        let shard = ShardInstance::in_memory("ks", 0, 1).unwrap();
        assert!(shard.process(&Request::put(b"a".to_vec(), b"1".to_vec())).is_ok());

        let response = shard.process(&Request::get(b"a".to_vec()));
        assert_eq!(response.key_value, Some(KeyValue::new(b"a".to_vec(), b"1".to_vec())));

        assert!(shard.process(&Request::delete(b"a".to_vec())).is_ok());
        let response = shard.process(&Request::get(b"a".to_vec()));
        assert!(response.is_ok());
        assert!(response.key_value.is_none());
    }

    #[test]
    fn test_writes_go_through_the_log() {
        let shard = ShardInstance::in_memory("ks", 0, 1).unwrap();
        let start = shard.log().segment_offset();
        shard.process(&Request::put(b"a".to_vec(), b"1".to_vec()));
        shard.process(&Request::delete(b"a".to_vec()));
        let entries = shard.log().entries_since(start).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].value.is_none());
    }

    #[test]
    fn test_fence_splits_snapshot_and_log() {
        let shard = ShardInstance::in_memory("ks", 0, 1).unwrap();
        shard.process(&Request::put(b"before".to_vec(), b"1".to_vec()));
        let (fence, snapshot) = shard.fence().unwrap();
        shard.process(&Request::put(b"after".to_vec(), b"2".to_vec()));

        assert!(snapshot.get(b"before").unwrap().is_some());
        assert!(snapshot.get(b"after").unwrap().is_none());
        let tail = shard.log().entries_since(fence).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].key, b"after".to_vec());
    }
}
