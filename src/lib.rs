// src/lib.rs

//! ringkv: a sharded key-value store with jump-hash routing and live
//! resharding.
//!
//! - [`topology`]: shard resolution and immutable cluster rings
//! - [`client`]: ring cache, connection pools and the request router
//! - [`master`]: published topology and client notification channels
//! - [`store`]: shard hosting and bootstrap copies for resharding

pub mod client;
pub mod common;
pub mod master;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod store;
pub mod topology;
pub mod transport;

pub use common::error::{KvError, Result};
