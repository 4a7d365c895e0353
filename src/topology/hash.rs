// src/topology/hash.rs

//! Shard resolution.
//!
//! Every process in the cluster (client, store, master) maps a partition
//! hash to a shard with the functions in this module. They must stay
//! bit-identical everywhere, otherwise requests are silently misrouted.

use std::hash::Hasher;
use twox_hash::XxHash64;
use crate::common::error::{KvError, Result};

/// Hash a key into its partition hash (xxhash64, seed 0).
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

/// Jump consistent hash (Lamping & Veach).
///
/// Maps a 64-bit hash to a bucket in `[0, num_buckets)`. Growing the bucket
/// count by one moves only ~1/(n+1) of the keys, all of them onto the new
/// bucket. `num_buckets` must be non-zero.
pub(crate) fn jump_hash(mut key: u64, num_buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < num_buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * (f64::from(1u32 << 31) / ((key >> 33) + 1) as f64)) as i64;
    }

    b as u32
}

/// Resolve the shard owning `partition_hash` in a cluster of `cluster_size` shards.
pub fn resolve(partition_hash: u64, cluster_size: u32) -> Result<u32> {
    if cluster_size == 0 {
        return Err(KvError::InvalidConfiguration(
            "cluster size must be at least 1".to_string(),
        ));
    }
    Ok(jump_hash(partition_hash, cluster_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_in_range() {
        for n in 1..=64u32 {
            for i in 0u64..500 {
                let shard = resolve(hash_key(&i.to_le_bytes()), n).unwrap();
                assert!(shard < n, "shard {} out of range for cluster size {}", shard, n);
            }
        }
    }

    #[test]
    fn test_single_shard_cluster() {
        for h in [0u64, 1, 42, u64::MAX] {
            assert_eq!(resolve(h, 1).unwrap(), 0);
        }
    }

    #[test]
    fn test_zero_cluster_size_is_invalid() {
        let result = resolve(12345, 0);
        assert!(matches!(result, Err(KvError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_known_values() {
        // Reference outputs of the published algorithm.
        assert_eq!(jump_hash(0, 1), 0);
        assert_eq!(jump_hash(0, 10), 0);
        assert_eq!(jump_hash(1, 10), 6);
        assert_eq!(jump_hash(2, 10), 6);
        assert_eq!(jump_hash(3, 10), 8);
    }

    #[test]
    fn test_growth_moves_only_to_new_shard() {
        for n in 1..40u32 {
            for i in 0u64..1000 {
                let h = hash_key(&i.to_be_bytes());
                let before = resolve(h, n).unwrap();
                let after = resolve(h, n + 1).unwrap();
                assert!(
                    after == before || after == n,
                    "key moved from {} to {} when growing {} -> {}",
                    before, after, n, n + 1
                );
            }
        }
    }

    #[test]
    fn test_growth_moves_few_keys() {
        let mut moved = 0;
        for i in 0u64..10_000 {
            let h = hash_key(&i.to_le_bytes());
            if resolve(h, 100).unwrap() != resolve(h, 101).unwrap() {
                moved += 1;
            }
        }
        // Expected ~99 of 10_000.
        assert!(moved > 30 && moved < 250, "moved {} keys", moved);
    }

    #[test]
    fn test_hash_key_deterministic() {
        assert_eq!(hash_key(b"user:42"), hash_key(b"user:42"));
        assert_ne!(hash_key(b"user:42"), hash_key(b"user:43"));
    }
}
