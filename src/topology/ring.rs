// src/topology/ring.rs

//! Cluster ring: the published shard-to-node assignment of one keyspace.
//!
//! A ring is never mutated once built. Every topology change (node added,
//! node removed, resize) produces a new ring instance.

use serde::{Serialize, Deserialize};
use crate::common::error::{KvError, Result};
use super::hash::jump_hash;

/// Largest number of shards a ring may have
pub const MAX_CLUSTER_SIZE: u32 = 1 << 16;

/// Largest number of replicas per shard
pub const MAX_REPLICATION_FACTOR: u32 = 16;

/// A store node serving one replica of a shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreNode {
    /// The store's identifier
    pub id: String,
    /// The store's client-facing address (host:port)
    pub address: String,
}

impl StoreNode {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self { id: id.into(), address: address.into() }
    }
}

/// How a request may be served by the replicas of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessOption {
    /// Only the primary (replica index 0) may serve the request
    PrimaryOnly,
    /// Any replica may serve the request, the primary is preferred
    AllowReplica,
    /// Exactly this replica index must serve the request
    Replica(usize),
}

/// Immutable snapshot of a keyspace's topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRing {
    keyspace: String,
    data_center: String,
    cluster_size: u32,
    replication_factor: u32,
    /// shard index -> replica slots, slot 0 is the primary
    shards: Vec<Vec<Option<StoreNode>>>,
}

impl ClusterRing {
    /// Create an empty ring with no node assigned yet
    pub fn new(
        keyspace: impl Into<String>,
        data_center: impl Into<String>,
        cluster_size: u32,
        replication_factor: u32,
    ) -> Result<Self> {
        let keyspace = keyspace.into();
        Self::check_sizes(&keyspace, cluster_size, replication_factor)?;
        Ok(Self {
            keyspace,
            data_center: data_center.into(),
            cluster_size,
            replication_factor,
            shards: vec![vec![None; replication_factor as usize]; cluster_size as usize],
        })
    }

    /// Reject sizes a ring cannot be built with
    pub fn check_sizes(keyspace: &str, cluster_size: u32, replication_factor: u32) -> Result<()> {
        if cluster_size == 0 || cluster_size > MAX_CLUSTER_SIZE {
            return Err(KvError::InvalidConfiguration(format!(
                "keyspace '{}': cluster size must be between 1 and {}, got {}",
                keyspace, MAX_CLUSTER_SIZE, cluster_size
            )));
        }
        if replication_factor == 0 || replication_factor > MAX_REPLICATION_FACTOR {
            return Err(KvError::InvalidConfiguration(format!(
                "keyspace '{}': replication factor must be between 1 and {}, got {}",
                keyspace, MAX_REPLICATION_FACTOR, replication_factor
            )));
        }
        Ok(())
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
    }

    /// Find the shard owning a partition hash under this ring's cluster size
    pub fn find_shard_id(&self, partition_hash: u64) -> u32 {
        jump_hash(partition_hash, self.cluster_size)
    }

    /// Replica slots of a shard, slot 0 is the primary
    pub fn shard_nodes(&self, shard_id: u32) -> Option<&[Option<StoreNode>]> {
        self.shards.get(shard_id as usize).map(Vec::as_slice)
    }

    /// Return a ring with `node` placed in the given replica slot
    pub fn with_node(&self, shard_id: u32, replica: usize, node: StoreNode) -> Result<Self> {
        let mut next = self.clone();
        *next.slot_mut(shard_id, replica)? = Some(node);
        Ok(next)
    }

    /// Return a ring with the given replica slot emptied
    pub fn without_node(&self, shard_id: u32, replica: usize) -> Result<Self> {
        let mut next = self.clone();
        *next.slot_mut(shard_id, replica)? = None;
        Ok(next)
    }

    fn slot_mut(&mut self, shard_id: u32, replica: usize) -> Result<&mut Option<StoreNode>> {
        let keyspace = self.keyspace.clone();
        let replication_factor = self.replication_factor;
        let slots = self.shards.get_mut(shard_id as usize).ok_or_else(|| {
            KvError::ShardNotFound { keyspace: keyspace.clone(), shard_id }
        })?;
        slots.get_mut(replica).ok_or_else(|| {
            KvError::InvalidConfiguration(format!(
                "keyspace '{}' shard {}: replica {} exceeds replication factor {}",
                keyspace, shard_id, replica, replication_factor
            ))
        })
    }

    /// Pick the node serving a shard under the given access options.
    ///
    /// Returns the node and its replica index. With no options the primary
    /// is required.
    pub fn node_for_shard(&self, shard_id: u32, options: &[AccessOption]) -> Result<(&StoreNode, usize)> {
        let slots = self.shard_nodes(shard_id).ok_or_else(|| KvError::ShardNotFound {
            keyspace: self.keyspace.clone(),
            shard_id,
        })?;

        let option = options.last().copied().unwrap_or(AccessOption::PrimaryOnly);
        let picked = match option {
            AccessOption::PrimaryOnly => slots.first().and_then(|s| s.as_ref()).map(|n| (n, 0)),
            AccessOption::Replica(index) => slots.get(index).and_then(|s| s.as_ref()).map(|n| (n, index)),
            AccessOption::AllowReplica => slots
                .iter()
                .enumerate()
                .find_map(|(index, slot)| slot.as_ref().map(|n| (n, index))),
        };

        picked.ok_or_else(|| {
            KvError::Connection(format!(
                "keyspace '{}' shard {} has no node for {:?}",
                self.keyspace, shard_id, option
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(size: u32, rf: u32) -> ClusterRing {
        let mut ring = ClusterRing::new("ks", "dc1", size, rf).unwrap();
        for shard in 0..size {
            for replica in 0..rf as usize {
                let node = StoreNode::new(format!("s{}r{}", shard, replica), format!("10.0.0.{}:{}", shard, 8000 + replica));
                ring = ring.with_node(shard, replica, node).unwrap();
            }
        }
        ring
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(matches!(ClusterRing::new("ks", "dc1", 0, 1), Err(KvError::InvalidConfiguration(_))));
        assert!(matches!(ClusterRing::new("ks", "dc1", 3, 0), Err(KvError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_oversized_ring_is_rejected() {
        assert!(matches!(
            ClusterRing::new("ks", "dc1", u32::MAX, 1),
            Err(KvError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            ClusterRing::new("ks", "dc1", 1, MAX_REPLICATION_FACTOR + 1),
            Err(KvError::InvalidConfiguration(_))
        ));
        let largest = ClusterRing::new("ks", "dc1", MAX_CLUSTER_SIZE, 1).unwrap();
        assert!(largest.shard_nodes(MAX_CLUSTER_SIZE - 1).is_some());
    }

    #[test]
    fn test_with_node_leaves_original_untouched() {
        let ring = ClusterRing::new("ks", "dc1", 2, 1).unwrap();
        let next = ring.with_node(1, 0, StoreNode::new("a", "127.0.0.1:1")).unwrap();
        assert!(ring.shard_nodes(1).unwrap()[0].is_none());
        assert_eq!(next.shard_nodes(1).unwrap()[0].as_ref().unwrap().id, "a");
        assert_eq!(next.cluster_size(), ring.cluster_size());
    }

    #[test]
    fn test_with_node_out_of_range() {
        let ring = ClusterRing::new("ks", "dc1", 2, 1).unwrap();
        assert!(matches!(
            ring.with_node(2, 0, StoreNode::new("a", "x")),
            Err(KvError::ShardNotFound { shard_id: 2, .. })
        ));
        assert!(ring.with_node(0, 1, StoreNode::new("a", "x")).is_err());
    }

    #[test]
    fn test_access_options() {
        let ring = ring_of(3, 2);
        let (node, index) = ring.node_for_shard(1, &[]).unwrap();
        assert_eq!((node.id.as_str(), index), ("s1r0", 0));

        let (node, index) = ring.node_for_shard(1, &[AccessOption::Replica(1)]).unwrap();
        assert_eq!((node.id.as_str(), index), ("s1r1", 1));

        let without_primary = ring.without_node(2, 0).unwrap();
        assert!(without_primary.node_for_shard(2, &[AccessOption::PrimaryOnly]).is_err());
        let (node, index) = without_primary.node_for_shard(2, &[AccessOption::AllowReplica]).unwrap();
        assert_eq!((node.id.as_str(), index), ("s2r1", 1));

        assert!(ring.node_for_shard(1, &[AccessOption::Replica(5)]).is_err());
        assert!(matches!(ring.node_for_shard(9, &[]), Err(KvError::ShardNotFound { .. })));
    }

    #[test]
    fn test_find_shard_id_matches_resolver() {
        let ring = ring_of(7, 1);
        for h in [0u64, 17, 99_999, u64::MAX] {
            assert_eq!(ring.find_shard_id(h), crate::topology::resolve(h, 7).unwrap());
        }
    }
}
