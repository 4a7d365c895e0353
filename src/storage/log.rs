// src/storage/log.rs

//! Write-log collaborator and an in-memory segmented log.

use std::sync::Mutex;
use crate::common::error::{KvError, Result};
use crate::protocol::LogPosition;

/// Default segment size before the log rolls to a new segment
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// A logged write. `value == None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub position: LogPosition,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl LogEntry {
    fn encoded_len(key: &[u8], value: Option<&[u8]>) -> u64 {
        // key length + value length + op byte
        (4 + 4 + 1 + key.len() + value.map_or(0, <[u8]>::len)) as u64
    }
}

/// The write log of one shard
pub trait LogManager: Send + Sync {
    /// Position the next appended entry will get. Never moves backwards.
    fn segment_offset(&self) -> LogPosition;

    /// Append a write and return the position it was written at
    fn append(&self, key: &[u8], value: Option<&[u8]>) -> Result<LogPosition>;

    /// Every entry at or after `position`, in log order
    fn entries_since(&self, position: LogPosition) -> Result<Vec<LogEntry>>;
}

struct LogState {
    entries: Vec<LogEntry>,
    next: LogPosition,
}

/// A segmented write log kept in memory
pub struct MemoryLog {
    segment_size: u64,
    state: Mutex<LogState>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }

    pub fn with_segment_size(segment_size: u64) -> Self {
        Self {
            segment_size: segment_size.max(1),
            state: Mutex::new(LogState {
                entries: Vec::new(),
                next: LogPosition::default(),
            }),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogManager for MemoryLog {
    fn segment_offset(&self) -> LogPosition {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).next
    }

    fn append(&self, key: &[u8], value: Option<&[u8]>) -> Result<LogPosition> {
        let mut state = self.state.lock().map_err(|_| {
            KvError::Internal("write log lock poisoned".to_string())
        })?;
        let position = state.next;
        state.entries.push(LogEntry {
            position,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
        });

        let next_offset = position.offset + LogEntry::encoded_len(key, value);
        state.next = if next_offset >= self.segment_size {
            LogPosition { segment: position.segment + 1, offset: 0 }
        } else {
            LogPosition { segment: position.segment, offset: next_offset }
        };
        Ok(position)
    }

    fn entries_since(&self, position: LogPosition) -> Result<Vec<LogEntry>> {
        let state = self.state.lock().map_err(|_| {
            KvError::Internal("write log lock poisoned".to_string())
        })?;
        let start = state.entries.partition_point(|e| e.position < position);
        Ok(state.entries[start..].to_vec())
    }
}
