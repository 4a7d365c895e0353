// src/common/error.rs

//! Error types shared by the client, master and store sides.

use std::fmt;
use std::io;
use thiserror::Error;

/// Custom error types for ringkv
#[derive(Error, Debug)]
pub enum KvError {
    #[error("keyspace '{0}' not found")]
    KeyspaceNotFound(String),

    #[error("keyspace '{keyspace}' shard {shard_id} not found")]
    ShardNotFound { keyspace: String, shard_id: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("client key is already in use: {0}")]
    AlreadyRegistered(String),

    #[error("client key is not in use: {0}")]
    NotRegistered(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The key is absent. A normal read outcome, not a failure.
    #[error("NotFound")]
    NotFound,

    #[error("shard {shard_id} process error: {source}")]
    Shard {
        shard_id: u32,
        #[source]
        source: Box<KvError>,
    },

    #[error("process error: {}", FailedShards(.0))]
    PartialBatchFailure(Vec<KvError>),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KvError {
    /// Wrap an error with the id of the shard batch it came from.
    pub fn for_shard(shard_id: u32, source: KvError) -> Self {
        KvError::Shard {
            shard_id,
            source: Box::new(source),
        }
    }

    /// Shard ids named by this error, in ascending order.
    pub fn failed_shards(&self) -> Vec<u32> {
        match self {
            KvError::Shard { shard_id, .. } => vec![*shard_id],
            KvError::PartialBatchFailure(errors) => {
                let mut ids: Vec<u32> = errors.iter().flat_map(|e| e.failed_shards()).collect();
                ids.sort_unstable();
                ids
            }
            _ => Vec::new(),
        }
    }

    /// Returns true if the error indicates a transient failure that might
    /// succeed on retry (e.g., connection error, timeout).
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Connection(_) => true,
            KvError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::UnexpectedEof
            ),
            KvError::Shard { source, .. } => source.is_retryable(),
            KvError::PartialBatchFailure(errors) => errors.iter().all(KvError::is_retryable),
            _ => false,
        }
    }
}

/// Display helper listing every shard error of a partial failure.
struct FailedShards<'a>(&'a [KvError]);

impl fmt::Display for FailedShards<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_names_every_shard() {
        let err = KvError::PartialBatchFailure(vec![
            KvError::for_shard(1, KvError::Connection("refused".to_string())),
            KvError::for_shard(3, KvError::Server("disk full".to_string())),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("shard 1 process error"));
        assert!(msg.contains("shard 3 process error"));
        assert_eq!(err.failed_shards(), vec![1, 3]);
    }

    #[test]
    fn test_retryable() {
        assert!(KvError::Connection("x".to_string()).is_retryable());
        assert!(KvError::for_shard(2, KvError::Connection("x".to_string())).is_retryable());
        assert!(!KvError::NotFound.is_retryable());
        assert!(!KvError::InvalidConfiguration("size 0".to_string()).is_retryable());
    }
}
