// src/transport/local.rs

//! In-process transport: tokio channels and direct calls into a `StoreServer`.
//!
//! Used to embed a whole cluster in one process, and by the tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use crate::common::error::{KvError, Result};
use crate::protocol::{BootstrapCopyRequest, BootstrapCopyResponse, Requests, Responses};
use crate::store::StoreServer;
use crate::topology::StoreNode;
use super::{ConnectionProvider, MessageSink, MessageSource, StoreConnection};

#[async_trait]
impl<T: Send + 'static> MessageSink<T> for mpsc::Sender<T> {
    async fn send(&mut self, msg: T) -> Result<()> {
        mpsc::Sender::send(self, msg)
            .await
            .map_err(|_| KvError::Connection("receiving side of the stream is closed".to_string()))
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSink<T> for mpsc::UnboundedSender<T> {
    async fn send(&mut self, msg: T) -> Result<()> {
        mpsc::UnboundedSender::send(self, msg)
            .map_err(|_| KvError::Connection("receiving side of the stream is closed".to_string()))
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSource<T> for mpsc::Receiver<T> {
    async fn recv(&mut self) -> Result<Option<T>> {
        Ok(mpsc::Receiver::recv(self).await)
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSource<T> for mpsc::UnboundedReceiver<T> {
    async fn recv(&mut self) -> Result<Option<T>> {
        Ok(mpsc::UnboundedReceiver::recv(self).await)
    }
}

/// A sink that keeps every message in memory
#[derive(Debug)]
pub struct LocalCollector<T> {
    pub messages: Vec<T>,
}

impl<T: Send + 'static> LocalCollector<T> {
    pub fn new() -> Self {
        Self { messages: Vec::new() }
    }
}

impl<T: Send + 'static> Default for LocalCollector<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSink<T> for LocalCollector<T> {
    async fn send(&mut self, msg: T) -> Result<()> {
        self.messages.push(msg);
        Ok(())
    }
}

/// A connection that calls a store server in the same process
pub struct LocalStoreConnection {
    server: Arc<StoreServer>,
}

#[async_trait]
impl StoreConnection for LocalStoreConnection {
    async fn send_requests(&mut self, requests: Requests) -> Result<Responses> {
        self.server.process_requests(requests).await
    }

    async fn bootstrap_copy(
        &mut self,
        request: BootstrapCopyRequest,
        sink: &mut dyn MessageSink<BootstrapCopyResponse>,
    ) -> Result<()> {
        self.server.bootstrap_copy(request, sink).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Resolves store addresses to in-process store servers
#[derive(Default)]
pub struct LocalConnector {
    servers: RwLock<HashMap<String, Arc<StoreServer>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server` reachable at `address`
    pub fn register(&self, address: impl Into<String>, server: Arc<StoreServer>) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.insert(address.into(), server);
    }

    /// Make `address` unreachable
    pub fn unregister(&self, address: &str) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.remove(address);
    }
}

#[async_trait]
impl ConnectionProvider for LocalConnector {
    async fn get_connection(&self, node: &StoreNode) -> Result<Box<dyn StoreConnection>> {
        let server = {
            let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
            servers.get(&node.address).cloned()
        };
        match server {
            Some(server) => Ok(Box::new(LocalStoreConnection { server })),
            None => Err(KvError::Connection(format!(
                "fail to dial {}: no such store",
                node.address
            ))),
        }
    }
}
