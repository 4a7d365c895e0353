// src/topology/mod.rs

//! Cluster topology shared by clients, stores and the master.

mod hash;
mod ring;

pub use hash::{hash_key, resolve};
pub(crate) use hash::jump_hash;
pub use ring::{AccessOption, ClusterRing, StoreNode, MAX_CLUSTER_SIZE, MAX_REPLICATION_FACTOR};
