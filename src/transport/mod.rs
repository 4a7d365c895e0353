// src/transport/mod.rs

//! Transport seams.
//!
//! The rest of the crate only talks to these traits. `tcp` implements them
//! with newline-delimited JSON over TCP, `local` with in-process channels.

pub mod local;
pub mod tcp;

use async_trait::async_trait;
use crate::common::error::Result;
use crate::protocol::{BootstrapCopyRequest, BootstrapCopyResponse, Requests, Responses};
use crate::topology::StoreNode;

/// The sending half of a message stream
#[async_trait]
pub trait MessageSink<T: Send + 'static>: Send {
    /// Enqueue one message. Fails once the peer is gone.
    async fn send(&mut self, msg: T) -> Result<()>;
}

/// The receiving half of a message stream
#[async_trait]
pub trait MessageSource<T: Send + 'static>: Send {
    /// Next message, or `None` on a clean end of stream
    async fn recv(&mut self) -> Result<Option<T>>;
}

/// A leased connection to one store node
#[async_trait]
pub trait StoreConnection: Send {
    /// Send one shard batch as a single round-trip
    async fn send_requests(&mut self, requests: Requests) -> Result<Responses>;

    /// Run a bootstrap copy, forwarding every streamed message to `sink`
    async fn bootstrap_copy(
        &mut self,
        request: BootstrapCopyRequest,
        sink: &mut dyn MessageSink<BootstrapCopyResponse>,
    ) -> Result<()>;

    /// Release the connection (back to its pool, if any)
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Hands out connections to store nodes
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn get_connection(&self, node: &StoreNode) -> Result<Box<dyn StoreConnection>>;
}
