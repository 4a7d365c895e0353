// src/server/mod.rs

//! TCP front ends of the store and master nodes.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use crate::common::error::{KvError, Result};
use crate::master::MasterServer;
use crate::protocol::{BootstrapCopyResponse, ClientHeartbeat, ClientMessage, StoreCommand, StoreReply};
use crate::store::StoreServer;
use crate::transport::tcp::{JsonLineReader, JsonLineWriter};
use crate::transport::{MessageSink, MessageSource};

/// Bind a listening socket
pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .map_err(|e| KvError::Connection(format!("Failed to bind to address {}: {}", address, e)))
}

/// Wraps bootstrap stream messages into store reply lines
struct ReplySink<'a, W> {
    writer: &'a mut JsonLineWriter<W, StoreReply>,
}

#[async_trait]
impl<W> MessageSink<BootstrapCopyResponse> for ReplySink<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: BootstrapCopyResponse) -> Result<()> {
        self.writer.send(StoreReply::Bootstrap(msg)).await
    }
}

async fn handle_store_connection(stream: TcpStream, store: Arc<StoreServer>) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    let mut reader: JsonLineReader<_, StoreCommand> = JsonLineReader::new(read_half);
    let mut writer: JsonLineWriter<_, StoreReply> = JsonLineWriter::new(write_half);

    loop {
        let command = match reader.recv().await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(KvError::Json(e)) => {
                warn!("Malformed command from {}: {}", peer_addr, e);
                writer.send(StoreReply::Error(format!("malformed command: {}", e))).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let reply = match command {
            StoreCommand::SendRequests(requests) => match store.process_requests(requests).await {
                Ok(responses) => StoreReply::Responses(responses),
                Err(e) => StoreReply::Error(e.to_string()),
            },
            StoreCommand::BootstrapCopy(request) => {
                let mut sink = ReplySink { writer: &mut writer };
                match store.bootstrap_copy(request, &mut sink).await {
                    Ok(()) => StoreReply::Done,
                    Err(e) => StoreReply::Error(e.to_string()),
                }
            }
            StoreCommand::DeleteKeyspace { keyspace } => match store.delete_keyspace(&keyspace) {
                Ok(()) => StoreReply::Done,
                Err(e) => StoreReply::Error(e.to_string()),
            },
        };
        writer.send(reply).await?;
    }
    debug!("Connection closed by peer {}", peer_addr);
    Ok(())
}

/// Serves store commands over TCP
pub struct StoreService {
    store: Arc<StoreServer>,
}

impl StoreService {
    pub fn new(store: Arc<StoreServer>) -> Self {
        Self { store }
    }

    pub async fn run(&self, address: &str) -> Result<()> {
        let listener = bind(address).await?;
        info!("ringkv store listening on {}", address);
        self.serve(listener).await
    }

    /// Accept connections forever
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("Accepted store connection from: {}", addr);
                    let store = Arc::clone(&self.store);
                    tokio::spawn(async move {
                        if let Err(e) = handle_store_connection(socket, store).await {
                            error!("Error handling connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn handle_master_connection(stream: TcpStream, addr: SocketAddr, master: Arc<MasterServer>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let heartbeats: JsonLineReader<_, ClientHeartbeat> = JsonLineReader::new(read_half);
    let sink: JsonLineWriter<_, ClientMessage> = JsonLineWriter::new(write_half);
    master.run_client_session(&addr.to_string(), heartbeats, sink).await
}

/// Serves client registrations over TCP. A client is identified by its
/// remote address.
pub struct MasterService {
    master: Arc<MasterServer>,
}

impl MasterService {
    pub fn new(master: Arc<MasterServer>) -> Self {
        Self { master }
    }

    pub async fn run(&self, address: &str) -> Result<()> {
        let listener = bind(address).await?;
        info!("ringkv master listening on {}", address);
        self.serve(listener).await
    }

    /// Accept connections forever
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let master = Arc::clone(&self.master);
                    tokio::spawn(async move {
                        if let Err(e) = handle_master_connection(socket, addr, master).await {
                            warn!("Client session {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
}
