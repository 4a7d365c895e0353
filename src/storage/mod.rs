// src/storage/mod.rs

//! Storage engine collaborator for store nodes.
//! Defines the engine interface the shard layer relies on and ships an
//! in-memory engine used for embedded clusters and tests.

pub mod codec;
pub mod log;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use crate::common::error::{KvError, Result};
use crate::protocol::KeyValue;

pub use log::{LogEntry, LogManager, MemoryLog};

/// Receives the row batches of a full scan
#[async_trait]
pub trait RowBatchHandler: Send {
    /// Handle one batch. An error stops the scan and is returned by it.
    async fn handle(&mut self, rows: Vec<KeyValue>) -> Result<()>;
}

/// The key-value engine behind one shard
#[async_trait]
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// A read-only point-in-time view. Later writes are not visible in it.
    ///
    /// Engines should make this cheap to take. The in-memory engine shares
    /// its rows with the view and copies them once, on the first write made
    /// while a view is alive.
    fn snapshot(&self) -> Result<Arc<dyn Database>>;

    /// Push every row, in key order, to `handler` in batches of `batch_size`
    async fn full_scan(&self, batch_size: usize, handler: &mut dyn RowBatchHandler) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Drop all data. The engine is unusable afterwards.
    fn destroy(&self) -> Result<()>;
}

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;

/// An ordered in-memory engine
pub struct MemoryDatabase {
    name: String,
    /// Shared with live snapshots, copied on write
    rows: RwLock<Arc<Rows>>,
    closed: AtomicBool,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!("Initializing in-memory database '{}'", name);
        Self {
            name,
            rows: RwLock::new(Arc::new(BTreeMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// A view sharing this engine's current rows
    fn frozen(&self) -> Result<MemoryDatabase> {
        self.check_open()?;
        let rows = Arc::clone(&*self.rows.read().map_err(|_| self.poisoned())?);
        Ok(MemoryDatabase {
            name: format!("{}@snapshot", self.name),
            rows: RwLock::new(rows),
            closed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::Internal(format!("database '{}' is closed", self.name)));
        }
        Ok(())
    }

    fn poisoned(&self) -> KvError {
        KvError::Internal(format!("database '{}' lock poisoned", self.name))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let rows = self.rows.read().map_err(|_| self.poisoned())?;
        Ok(rows.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        Arc::make_mut(&mut *rows).insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        Arc::make_mut(&mut *rows).remove(key);
        Ok(())
    }

    fn snapshot(&self) -> Result<Arc<dyn Database>> {
        Ok(Arc::new(self.frozen()?))
    }

    async fn full_scan(&self, batch_size: usize, handler: &mut dyn RowBatchHandler) -> Result<()> {
        self.check_open()?;
        let batch_size = batch_size.max(1);
        let mut start: Bound<Vec<u8>> = Bound::Unbounded;
        loop {
            let batch: Vec<KeyValue> = {
                let rows = self.rows.read().map_err(|_| self.poisoned())?;
                rows.range((start.clone(), Bound::Unbounded))
                    .take(batch_size)
                    .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                    .collect()
            };
            let Some(last) = batch.last() else {
                return Ok(());
            };
            let done = batch.len() < batch_size;
            start = Bound::Excluded(last.key.clone());
            handler.handle(batch).await?;
            if done {
                return Ok(());
            }
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut rows = self.rows.write().map_err(|_| self.poisoned())?;
        *rows = Arc::new(BTreeMap::new());
        info!("Database '{}' destroyed", self.name);
        Ok(())
    }
}
