// src/client/mod.rs

//! ringkv client library.
//!
//! A [`ClusterClient`] routes keyed requests of one keyspace to the stores
//! owning them, using the rings kept fresh by a shared [`ClusterListener`].

pub mod listener;
pub mod pool;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use crate::common::error::{KvError, Result};
use crate::protocol::{KeyValue, Request, Requests, Response};
use crate::topology::{AccessOption, ClusterRing};

pub use listener::{ClusterListener, PendingResize, ReconnectBackoff};
pub use pool::{ConnectionPool, NodePools, PoolOptions, PooledConnection};

/// Routes requests of one keyspace
#[derive(Clone)]
pub struct ClusterClient {
    keyspace: String,
    listener: Arc<ClusterListener>,
}

impl ClusterClient {
    /// Create a client and subscribe the listener to `keyspace`
    pub fn new(keyspace: impl Into<String>, listener: Arc<ClusterListener>) -> Self {
        let keyspace = keyspace.into();
        listener.add_new_keyspace(&keyspace);
        Self { keyspace, listener }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn listener(&self) -> &Arc<ClusterListener> {
        &self.listener
    }

    /// The ring requests are currently routed with
    pub fn get_cluster(&self) -> Result<Arc<ClusterRing>> {
        self.listener
            .get_cluster(&self.keyspace)
            .ok_or_else(|| KvError::KeyspaceNotFound(self.keyspace.clone()))
    }

    /// Route `requests` by shard and send one batch per shard concurrently.
    ///
    /// `on_result` runs once per successful shard batch with the batch's
    /// requests and their positional responses. Failed shards (including a
    /// shard whose `on_result` failed) are reported together as
    /// [`KvError::PartialBatchFailure`] after every other shard's results
    /// were delivered.
    pub async fn batch_process<F>(
        &self,
        requests: Vec<Request>,
        options: &[AccessOption],
        mut on_result: F,
    ) -> Result<()>
    where
        F: FnMut(&[Request], Vec<Response>) -> Result<()>,
    {
        if requests.is_empty() {
            return Ok(());
        }
        let ring = self.get_cluster()?;

        let mut batches: BTreeMap<u32, Vec<Request>> = BTreeMap::new();
        for mut request in requests {
            request.shard_id = ring.find_shard_id(request.partition_hash);
            batches.entry(request.shard_id).or_default().push(request);
        }
        debug!(
            "keyspace '{}': dispatching {} shard batches",
            self.keyspace, batches.len()
        );

        let mut tasks = JoinSet::new();
        for (shard_id, batch) in batches {
            let listener = Arc::clone(&self.listener);
            let ring = Arc::clone(&ring);
            let options = options.to_vec();
            tasks.spawn(async move {
                let result = send_requests_to_one_shard(&listener, &ring, shard_id, batch.clone(), &options).await;
                (shard_id, batch, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((shard_id, batch, Ok(responses))) => {
                    if let Err(e) = on_result(&batch, responses) {
                        failures.push(KvError::for_shard(shard_id, e));
                    }
                }
                Ok((shard_id, _, Err(e))) => {
                    warn!("keyspace '{}' shard {}: {}", self.keyspace, shard_id, e);
                    failures.push(KvError::for_shard(shard_id, e));
                }
                Err(e) => failures.push(KvError::Internal(format!("shard task failed: {}", e))),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|e| e.failed_shards().first().copied().unwrap_or(u32::MAX));
        Err(KvError::PartialBatchFailure(failures))
    }

    async fn process_one(&self, request: Request, options: &[AccessOption]) -> Result<Response> {
        let mut reply = None;
        self.batch_process(vec![request], options, |_, responses| {
            reply = responses.into_iter().next();
            Ok(())
        })
        .await
        .map_err(unwrap_single_shard)?;
        reply.ok_or_else(|| KvError::Internal("store returned no response".to_string()))
    }

    /// Read one key. A missing key is [`KvError::NotFound`].
    pub async fn get(&self, key: impl Into<Vec<u8>>, options: &[AccessOption]) -> Result<Vec<u8>> {
        let response = self.process_one(Request::get(key), options).await?;
        if !response.is_ok() {
            return Err(KvError::Server(response.status));
        }
        match response.key_value {
            Some(kv) => Ok(kv.value),
            None => Err(KvError::NotFound),
        }
    }

    /// Write one key. `ttl_second == 0` never expires.
    pub async fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, ttl_second: u32) -> Result<()> {
        let request = Request::put(key, value).with_ttl(ttl_second);
        let response = self.process_one(request, &[AccessOption::PrimaryOnly]).await?;
        status_to_result(response)
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        let response = self.process_one(Request::delete(key), &[AccessOption::PrimaryOnly]).await?;
        status_to_result(response)
    }

    /// Read many keys at once. Missing keys are left out of the result.
    pub async fn batch_get(&self, keys: Vec<Vec<u8>>, options: &[AccessOption]) -> Result<Vec<KeyValue>> {
        let requests = keys.into_iter().map(Request::get).collect();
        let mut found = Vec::new();
        self.batch_process(requests, options, |_, responses| {
            for response in responses {
                if !response.is_ok() {
                    return Err(KvError::Server(response.status));
                }
                found.extend(response.key_value);
            }
            Ok(())
        })
        .await?;
        Ok(found)
    }
}

/// Send one shard batch over a leased connection and check the reply shape
async fn send_requests_to_one_shard(
    listener: &ClusterListener,
    ring: &ClusterRing,
    shard_id: u32,
    requests: Vec<Request>,
    options: &[AccessOption],
) -> Result<Vec<Response>> {
    let (mut connection, replica) = listener.get_connection_in_ring(ring, shard_id, options).await?;
    let expected = requests.len();
    let result = connection
        .send_requests(Requests { keyspace: ring.keyspace().to_string(), requests })
        .await;
    let responses = match result {
        Ok(responses) => responses.responses,
        Err(e) => {
            // The stream may hold a half-read reply; do not hand it back.
            drop(connection);
            return Err(e);
        }
    };
    connection.close().await?;
    if responses.len() != expected {
        return Err(KvError::Internal(format!(
            "shard {} replica {} returned {} responses for {} requests",
            shard_id, replica, responses.len(), expected
        )));
    }
    Ok(responses)
}

/// A single-request batch fails as one shard; surface its cause directly.
fn unwrap_single_shard(err: KvError) -> KvError {
    match err {
        KvError::PartialBatchFailure(mut errors) if errors.len() == 1 => match errors.remove(0) {
            KvError::Shard { source, .. } => *source,
            other => other,
        },
        other => other,
    }
}

fn status_to_result(response: Response) -> Result<()> {
    if response.is_ok() {
        Ok(())
    } else {
        Err(KvError::Server(response.status))
    }
}
