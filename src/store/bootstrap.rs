// src/store/bootstrap.rs

//! Bootstrap copy: stream a shard's rows to a new owner.
//!
//! The log position is read before the scan starts (see
//! [`ShardInstance::fence`]). Every write before it is in the scan, every
//! write after it is only reachable by tailing the log from it. The position
//! is sent last so the receiver can continue tailing with no gap and no
//! duplicate.

use async_trait::async_trait;
use tracing::{info, warn};
use crate::common::error::{KvError, Result};
use crate::protocol::{BootstrapCopyRequest, BootstrapCopyResponse, KeyValue};
use crate::storage::RowBatchHandler;
use crate::storage::codec::partition_hash_from_bytes;
use crate::topology::jump_hash;
use crate::transport::MessageSink;
use super::shard::ShardInstance;

/// Rows per scan batch for a plain copy
pub const BOOTSTRAP_BATCH_SIZE: usize = 1024;

/// Keys under this prefix are store bookkeeping and never migrate
pub const INTERNAL_PREFIX: &[u8] = b"_ringkv.";

/// Keep only the rows a target shard owns in a cluster of a given size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TargetFilter {
    cluster_size: u32,
    shard_id: u32,
}

impl TargetFilter {
    /// `None` means a plain copy: the target is absent or is this shard itself
    fn for_request(shard: &ShardInstance, request: &BootstrapCopyRequest) -> Result<Option<Self>> {
        if request.target_cluster_size == 0 {
            return Ok(None);
        }
        if request.target_shard_id >= request.target_cluster_size {
            return Err(KvError::InvalidConfiguration(format!(
                "target shard {} does not fit target cluster size {}",
                request.target_shard_id, request.target_cluster_size
            )));
        }
        if request.target_cluster_size == shard.cluster_size() && request.target_shard_id == shard.id() {
            return Ok(None);
        }
        Ok(Some(Self {
            cluster_size: request.target_cluster_size,
            shard_id: request.target_shard_id,
        }))
    }

    fn keeps(&self, row: &KeyValue) -> bool {
        match partition_hash_from_bytes(&row.value) {
            Some(hash) => jump_hash(hash, self.cluster_size) == self.shard_id,
            None => {
                warn!("skipping row with undecodable value, key {:?}", String::from_utf8_lossy(&row.key));
                false
            }
        }
    }
}

/// Filters scanned batches and forwards them to the stream
struct Forwarder<'a> {
    filter: Option<TargetFilter>,
    sink: &'a mut dyn MessageSink<BootstrapCopyResponse>,
    rows_sent: usize,
}

#[async_trait]
impl RowBatchHandler for Forwarder<'_> {
    async fn handle(&mut self, rows: Vec<KeyValue>) -> Result<()> {
        let filter = self.filter;
        let rows: Vec<KeyValue> = rows
            .into_iter()
            .filter(|row| !row.key.starts_with(INTERNAL_PREFIX))
            .filter(|row| filter.as_ref().is_none_or(|f| f.keeps(row)))
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        self.rows_sent += rows.len();
        self.sink.send(BootstrapCopyResponse::KeyValues(rows)).await
    }
}

/// Stream `shard`'s rows, then the fencing position, to `sink`
pub async fn bootstrap_copy(
    shard: &ShardInstance,
    request: &BootstrapCopyRequest,
    sink: &mut dyn MessageSink<BootstrapCopyResponse>,
) -> Result<()> {
    let filter = TargetFilter::for_request(shard, request)?;
    let (fence, snapshot) = shard.fence()?;

    let batch_size = match filter {
        Some(f) => BOOTSTRAP_BATCH_SIZE * f.cluster_size as usize,
        None => BOOTSTRAP_BATCH_SIZE,
    };

    let mut forwarder = Forwarder { filter, sink, rows_sent: 0 };
    let scanned = snapshot.full_scan(batch_size, &mut forwarder).await;
    let rows_sent = forwarder.rows_sent;

    let tail = forwarder
        .sink
        .send(BootstrapCopyResponse::BinlogTailProgress(fence))
        .await;

    match &scanned {
        Ok(()) => info!(
            "bootstrap copy keyspace '{}' shard {} -> target {:?}: {} rows, tail at {:?}",
            shard.keyspace(), shard.id(), filter, rows_sent, fence
        ),
        Err(e) => warn!(
            "bootstrap copy keyspace '{}' shard {} aborted after {} rows: {}",
            shard.keyspace(), shard.id(), rows_sent, e
        ),
    }
    scanned?;
    tail
}
