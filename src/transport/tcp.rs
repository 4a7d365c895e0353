// src/transport/tcp.rs

//! Newline-delimited JSON over TCP.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::debug;
use crate::common::error::{KvError, Result};
use crate::protocol::{
    BootstrapCopyRequest, BootstrapCopyResponse, ClientHeartbeat, ClientMessage, Requests,
    Responses, StoreCommand, StoreReply,
};
use super::{MessageSink, MessageSource, StoreConnection};

/// Options for configuring a connection to a store or master.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout of one request/response round-trip.
    pub operation_timeout: Duration,
    /// TCP no delay (Nagle's algorithm).
    pub tcp_nodelay: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(60),
            tcp_nodelay: true,
        }
    }
}

/// Reads one JSON document per line
pub struct JsonLineReader<R, T> {
    reader: BufReader<R>,
    line: String,
    _marker: PhantomData<fn() -> T>,
}

impl<R: AsyncRead + Unpin, T> JsonLineReader<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, T> MessageSource<T> for JsonLineReader<R, T>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

/// Writes one JSON document per line
pub struct JsonLineWriter<W, T> {
    writer: W,
    _marker: PhantomData<fn(T)>,
}

impl<W: AsyncWrite + Unpin, T> JsonLineWriter<W, T> {
    pub fn new(writer: W) -> Self {
        Self { writer, _marker: PhantomData }
    }
}

#[async_trait]
impl<W, T> MessageSink<T> for JsonLineWriter<W, T>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Send + 'static,
{
    async fn send(&mut self, msg: T) -> Result<()> {
        let mut json = serde_json::to_vec(&msg)?;
        json.push(b'\n');
        self.writer.write_all(&json).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

async fn connect(address: &str, options: &ConnectionOptions) -> Result<TcpStream> {
    let stream = match timeout(options.connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(KvError::Connection(format!("fail to dial {}: {}", address, e))),
        Err(_) => {
            return Err(KvError::Connection(format!(
                "dial {} timed out after {:?}",
                address, options.connect_timeout
            )))
        }
    };
    stream.set_nodelay(options.tcp_nodelay)?;
    Ok(stream)
}

/// A connection to a store node.
pub struct TcpStoreConnection {
    address: String,
    reader: JsonLineReader<OwnedReadHalf, StoreReply>,
    writer: JsonLineWriter<OwnedWriteHalf, StoreCommand>,
    options: ConnectionOptions,
}

impl TcpStoreConnection {
    /// Create a new connection to a store.
    pub async fn connect(address: &str, options: ConnectionOptions) -> Result<Self> {
        let stream = connect(address, &options).await?;
        let (read_half, write_half) = stream.into_split();
        debug!("connected to store {}", address);
        Ok(Self {
            address: address.to_string(),
            reader: JsonLineReader::new(read_half),
            writer: JsonLineWriter::new(write_half),
            options,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Ask the store to drop every local shard of a keyspace.
    pub async fn delete_keyspace(&mut self, keyspace: &str) -> Result<()> {
        self.writer
            .send(StoreCommand::DeleteKeyspace { keyspace: keyspace.to_string() })
            .await?;
        match self.next_reply().await? {
            StoreReply::Done => Ok(()),
            StoreReply::Error(msg) => Err(KvError::Server(msg)),
            other => Err(KvError::Internal(format!("unexpected store reply: {:?}", other))),
        }
    }

    async fn next_reply(&mut self) -> Result<StoreReply> {
        match self.reader.recv().await? {
            Some(reply) => Ok(reply),
            None => Err(KvError::Connection(format!(
                "connection to {} closed by server",
                self.address
            ))),
        }
    }
}

#[async_trait]
impl StoreConnection for TcpStoreConnection {
    async fn send_requests(&mut self, requests: Requests) -> Result<Responses> {
        let operation_timeout = self.options.operation_timeout;
        let address = self.address.clone();
        let round_trip = async {
            self.writer.send(StoreCommand::SendRequests(requests)).await?;
            match self.next_reply().await? {
                StoreReply::Responses(responses) => Ok(responses),
                StoreReply::Error(msg) => Err(KvError::Server(msg)),
                other => Err(KvError::Internal(format!("unexpected store reply: {:?}", other))),
            }
        };
        match timeout(operation_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Connection(format!(
                "request to {} timed out after {:?}",
                address, operation_timeout
            ))),
        }
    }

    async fn bootstrap_copy(
        &mut self,
        request: BootstrapCopyRequest,
        sink: &mut dyn MessageSink<BootstrapCopyResponse>,
    ) -> Result<()> {
        self.writer.send(StoreCommand::BootstrapCopy(request)).await?;
        loop {
            match self.next_reply().await? {
                StoreReply::Bootstrap(msg) => sink.send(msg).await?,
                StoreReply::Done => return Ok(()),
                StoreReply::Error(msg) => return Err(KvError::Server(msg)),
                other => {
                    return Err(KvError::Internal(format!("unexpected store reply: {:?}", other)))
                }
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut writer = this.writer.writer;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Open the registration stream to a master: heartbeats out, topology in.
pub async fn connect_master(
    address: &str,
    options: &ConnectionOptions,
) -> Result<(
    JsonLineWriter<OwnedWriteHalf, ClientHeartbeat>,
    JsonLineReader<OwnedReadHalf, ClientMessage>,
)> {
    let stream = connect(address, options).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((JsonLineWriter::new(write_half), JsonLineReader::new(read_half)))
}
