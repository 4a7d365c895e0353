// src/protocol/mod.rs

//! Wire message shapes exchanged between clients, stores and the master.

use serde::{Serialize, Deserialize};
use crate::topology::{hash_key, ClusterRing, StoreNode};

/// A stored key and its (encoded) value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// The operation a request performs on its key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get,
    Put {
        value: Vec<u8>,
        #[serde(default)]
        ttl_second: u32,
    },
    Delete,
}

/// A single keyed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub key: Vec<u8>,
    /// Computed once when the request is built
    pub partition_hash: u64,
    /// Filled in by the router once the request is resolved
    #[serde(default)]
    pub shard_id: u32,
    pub operation: Operation,
}

impl Request {
    fn with_operation(key: impl Into<Vec<u8>>, operation: Operation) -> Self {
        let key = key.into();
        let partition_hash = hash_key(&key);
        Self { key, partition_hash, shard_id: 0, operation }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::with_operation(key, Operation::Get)
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::with_operation(key, Operation::Put { value: value.into(), ttl_second: 0 })
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::with_operation(key, Operation::Delete)
    }

    /// Expire a put after `ttl_second` seconds. No effect on other operations.
    pub fn with_ttl(mut self, ttl_second: u32) -> Self {
        if let Operation::Put { ttl_second: ttl, .. } = &mut self.operation {
            *ttl = ttl_second;
        }
        self
    }

    /// Override the partition hash, e.g. to co-locate related keys
    pub fn with_partition_hash(mut self, partition_hash: u64) -> Self {
        self.partition_hash = partition_hash;
        self
    }
}

/// A shard batch: requests of one keyspace destined for the same shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requests {
    pub keyspace: String,
    pub requests: Vec<Request>,
}

/// Reply to one request. An empty status means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub key_value: Option<KeyValue>,
}

impl Response {
    pub fn ok(key_value: Option<KeyValue>) -> Self {
        Self { status: String::new(), key_value }
    }

    pub fn error(status: impl Into<String>) -> Self {
        Self { status: status.into(), key_value: None }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_empty()
    }
}

/// Replies to a shard batch, positionally correlated with its requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Responses {
    pub responses: Vec<Response>,
}

/// Ask a store to stream a shard's rows.
///
/// `target_cluster_size == 0` asks for every row. Otherwise only rows that
/// `target_shard_id` owns in a cluster of `target_cluster_size` shards are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapCopyRequest {
    pub keyspace: String,
    pub shard_id: u32,
    #[serde(default)]
    pub target_shard_id: u32,
    #[serde(default)]
    pub target_cluster_size: u32,
}

/// A write-log coordinate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub segment: u32,
    pub offset: u64,
}

/// One message of a bootstrap copy stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapCopyResponse {
    KeyValues(Vec<KeyValue>),
    /// Trailing marker: everything before this position is in the copy
    BinlogTailProgress(LogPosition),
}

/// Sent by a client to subscribe to a keyspace's topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeartbeat {
    pub keyspace: String,
    pub data_center: String,
}

/// A store now serves (or stopped serving) one replica of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResource {
    pub keyspace: String,
    pub shard_id: u32,
    pub replica: usize,
    pub node: StoreNode,
}

/// Topology push from the master to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Cluster(ClusterRing),
    Resize {
        keyspace: String,
        current_cluster_size: u32,
        next_cluster_size: u32,
    },
    StoreResourceUpdate {
        stores: Vec<StoreResource>,
        is_delete: bool,
    },
}

/// A request line on a store connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreCommand {
    SendRequests(Requests),
    BootstrapCopy(BootstrapCopyRequest),
    DeleteKeyspace { keyspace: String },
}

/// A reply line on a store connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreReply {
    Responses(Responses),
    Bootstrap(BootstrapCopyResponse),
    /// End of a command with no more reply lines
    Done,
    Error(String),
}
