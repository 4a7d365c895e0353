// src/storage/codec.rs

//! Stored value layout.
//!
//! ```text
//! | partition hash (u64 BE) | updated at ns (u64 BE) | ttl seconds (u32 BE) | value ... |
//! ```
//!
//! The partition hash leads the value so a store can recompute a row's shard
//! under any cluster size without knowing how the key was hashed.

use std::time::{SystemTime, UNIX_EPOCH};
use crate::common::error::{KvError, Result};

const HEADER_LEN: usize = 8 + 8 + 4;

/// A decoded stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub partition_hash: u64,
    pub updated_at_ns: u64,
    pub ttl_second: u32,
    pub value: Vec<u8>,
}

impl Entry {
    /// Create an entry stamped with the current time
    pub fn new(partition_hash: u64, ttl_second: u32, value: Vec<u8>) -> Self {
        let updated_at_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self { partition_hash, updated_at_ns, ttl_second, value }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.value.len());
        buf.extend_from_slice(&self.partition_hash.to_be_bytes());
        buf.extend_from_slice(&self.updated_at_ns.to_be_bytes());
        buf.extend_from_slice(&self.ttl_second.to_be_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(KvError::Internal(format!(
                "stored value too short: {} bytes",
                bytes.len()
            )));
        }
        let (hash, rest) = bytes.split_at(8);
        let (updated, rest) = rest.split_at(8);
        let (ttl, value) = rest.split_at(4);
        Ok(Self {
            partition_hash: u64::from_be_bytes(hash.try_into().map_err(|_| short())?),
            updated_at_ns: u64::from_be_bytes(updated.try_into().map_err(|_| short())?),
            ttl_second: u32::from_be_bytes(ttl.try_into().map_err(|_| short())?),
            value: value.to_vec(),
        })
    }

    /// True once the ttl has passed. A zero ttl never expires.
    pub fn is_expired(&self, now_ns: u64) -> bool {
        self.ttl_second > 0
            && now_ns > self.updated_at_ns.saturating_add(self.ttl_second as u64 * 1_000_000_000)
    }
}

fn short() -> KvError {
    KvError::Internal("stored value header is truncated".to_string())
}

/// Read only the partition hash of an encoded value
pub fn partition_hash_from_bytes(bytes: &[u8]) -> Option<u64> {
    bytes.get(..8).and_then(|b| b.try_into().ok()).map(u64::from_be_bytes)
}
