// src/master/channels.rs

//! Per-client notification channels on the master.
//!
//! Each registered client owns one bounded channel keyed by
//! `"{data_center}:{server}"`. Sends are made while the registry lock is
//! held, so one client that stops draining its full channel stalls every
//! broadcast to its data center until it drains or is removed.

use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use crate::common::config::DEFAULT_CLIENT_CHANNEL_CAPACITY;
use crate::common::error::{KvError, Result};
use crate::protocol::{ClientMessage, StoreResource};
use crate::topology::ClusterRing;

fn client_key(data_center: &str, server: &str) -> String {
    format!("{}:{}", data_center, server)
}

/// Registry of connected clients' outbound channels
pub struct ClientChannels {
    capacity: usize,
    clients: Mutex<HashMap<String, mpsc::Sender<ClientMessage>>>,
}

impl Default for ClientChannels {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_CHANNEL_CAPACITY)
    }
}

impl ClientChannels {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register a client and return the receiving end of its channel
    pub async fn add_client(&self, data_center: &str, server: &str) -> Result<mpsc::Receiver<ClientMessage>> {
        let key = client_key(data_center, server);
        let mut clients = self.clients.lock().await;
        if clients.contains_key(&key) {
            return Err(KvError::AlreadyRegistered(key));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        debug!("client {} registered", key);
        clients.insert(key, tx);
        Ok(rx)
    }

    /// Unregister a client. Its receiver sees the channel close.
    pub async fn remove_client(&self, data_center: &str, server: &str) -> Result<()> {
        let key = client_key(data_center, server);
        let mut clients = self.clients.lock().await;
        match clients.remove(&key) {
            Some(_sender) => {
                debug!("client {} removed", key);
                Ok(())
            }
            None => Err(KvError::NotRegistered(key)),
        }
    }

    pub async fn is_registered(&self, data_center: &str, server: &str) -> bool {
        self.clients.lock().await.contains_key(&client_key(data_center, server))
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Enqueue a message for one client
    pub async fn send_client(&self, data_center: &str, server: &str, msg: ClientMessage) -> Result<()> {
        let key = client_key(data_center, server);
        let clients = self.clients.lock().await;
        let Some(tx) = clients.get(&key) else {
            return Err(KvError::NotRegistered(key));
        };
        tx.send(msg).await.map_err(|_| KvError::NotRegistered(key))
    }

    /// Enqueue a message for every client of a data center.
    ///
    /// Clients whose receiver is already gone are reported together in one
    /// `NotRegistered` error after every other client got the message.
    pub async fn notify_clients(&self, data_center: &str, msg: ClientMessage) -> Result<()> {
        let prefix = format!("{}:", data_center);
        let clients = self.clients.lock().await;
        let mut vanished = Vec::new();
        for (key, tx) in clients.iter() {
            if !key.starts_with(&prefix) {
                continue;
            }
            if tx.send(msg.clone()).await.is_err() {
                vanished.push(key.clone());
            }
        }
        if vanished.is_empty() {
            return Ok(());
        }
        vanished.sort();
        warn!("notify {}: clients gone during broadcast: {:?}", data_center, vanished);
        Err(KvError::NotRegistered(vanished.join(",")))
    }

    /// Broadcast that stores started (or stopped) serving shards
    pub async fn notify_store_resource_update(
        &self,
        data_center: &str,
        stores: Vec<StoreResource>,
        is_delete: bool,
    ) -> Result<()> {
        self.notify_clients(data_center, ClientMessage::StoreResourceUpdate { stores, is_delete })
            .await
    }

    /// Send one client the full ring of a keyspace
    pub async fn send_client_cluster(&self, data_center: &str, server: &str, ring: &ClusterRing) -> Result<()> {
        self.send_client(data_center, server, ClientMessage::Cluster(ring.clone()))
            .await
    }

    /// Broadcast a resize of `keyspace` from `current` to `next` shards
    pub async fn notify_cluster_size(
        &self,
        data_center: &str,
        keyspace: &str,
        current_cluster_size: u32,
        next_cluster_size: u32,
    ) -> Result<()> {
        self.notify_clients(
            data_center,
            ClientMessage::Resize {
                keyspace: keyspace.to_string(),
                current_cluster_size,
                next_cluster_size,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::topology::StoreNode;

    fn resize(next: u32) -> ClientMessage {
        ClientMessage::Resize {
            keyspace: "ks".to_string(),
            current_cluster_size: 2,
            next_cluster_size: next,
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let channels = ClientChannels::default();
        let _rx = channels.add_client("dc1", "10.0.0.1:5000").await.unwrap();
        let second = channels.add_client("dc1", "10.0.0.1:5000").await;
        assert!(matches!(second, Err(KvError::AlreadyRegistered(key)) if key == "dc1:10.0.0.1:5000"));

        channels.remove_client("dc1", "10.0.0.1:5000").await.unwrap();
        assert!(channels.add_client("dc1", "10.0.0.1:5000").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_unknown_client() {
        let channels = ClientChannels::default();
        assert!(matches!(
            channels.remove_client("dc1", "nobody").await,
            Err(KvError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_closes_channel() {
        let channels = ClientChannels::default();
        let mut rx = channels.add_client("dc1", "a").await.unwrap();
        channels.remove_client("dc1", "a").await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_client() {
        let channels = ClientChannels::default();
        let mut rx = channels.add_client("dc1", "a").await.unwrap();
        channels.send_client("dc1", "a", resize(4)).await.unwrap();
        assert_eq!(rx.recv().await, Some(resize(4)));

        assert!(matches!(
            channels.send_client("dc1", "b", resize(4)).await,
            Err(KvError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_notify_clients_is_scoped_to_data_center() {
        let channels = ClientChannels::default();
        let mut a = channels.add_client("dc1", "a").await.unwrap();
        let mut b = channels.add_client("dc1", "b").await.unwrap();
        let mut c = channels.add_client("dc2", "c").await.unwrap();
        // "dc10" must not match the "dc1:" prefix.
        let mut d = channels.add_client("dc10", "d").await.unwrap();

        channels.notify_cluster_size("dc1", "ks", 2, 4).await.unwrap();

        assert_eq!(a.recv().await, Some(resize(4)));
        assert_eq!(b.recv().await, Some(resize(4)));
        assert!(c.try_recv().is_err());
        assert!(d.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_are_fifo_per_client() {
        let channels = ClientChannels::default();
        let mut rx = channels.add_client("dc1", "a").await.unwrap();
        for next in [3, 4, 5] {
            channels.notify_cluster_size("dc1", "ks", 2, next).await.unwrap();
        }
        for next in [3, 4, 5] {
            assert_eq!(rx.recv().await, Some(resize(next)));
        }
    }

    #[tokio::test]
    async fn test_typed_wrappers() {
        let channels = ClientChannels::default();
        let mut rx = channels.add_client("dc1", "a").await.unwrap();

        let ring = ClusterRing::new("ks", "dc1", 2, 1).unwrap();
        channels.send_client_cluster("dc1", "a", &ring).await.unwrap();
        assert_eq!(rx.recv().await, Some(ClientMessage::Cluster(ring)));

        let store = StoreResource {
            keyspace: "ks".to_string(),
            shard_id: 1,
            replica: 0,
            node: StoreNode::new("s1", "127.0.0.1:9001"),
        };
        channels
            .notify_store_resource_update("dc1", vec![store.clone()], true)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ClientMessage::StoreResourceUpdate { stores: vec![store], is_delete: true })
        );
    }

    #[tokio::test]
    async fn test_vanished_receiver_is_reported() {
        let channels = ClientChannels::default();
        let mut alive = channels.add_client("dc1", "alive").await.unwrap();
        drop(channels.add_client("dc1", "gone").await.unwrap());

        let result = channels.notify_cluster_size("dc1", "ks", 2, 4).await;
        assert!(matches!(result, Err(KvError::NotRegistered(key)) if key == "dc1:gone"));
        assert_eq!(alive.recv().await, Some(resize(4)));
    }

    #[tokio::test]
    async fn test_full_channel_blocks_broadcast_until_drained() {
        let channels = std::sync::Arc::new(ClientChannels::new(1));
        let mut rx = channels.add_client("dc1", "slow").await.unwrap();
        channels.notify_cluster_size("dc1", "ks", 2, 3).await.unwrap();

        let blocked = {
            let channels = std::sync::Arc::clone(&channels);
            tokio::spawn(async move { channels.notify_cluster_size("dc1", "ks", 2, 4).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert_eq!(rx.recv().await, Some(resize(3)));
        blocked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(resize(4)));
    }
}
