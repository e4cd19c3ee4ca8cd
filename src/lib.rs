//! Cluster topology discovery and request routing core for a Redis Cluster
//! proxy: slot hashing, the `CLUSTER NODES` parser, the live slot index,
//! the quiescence-based reconfiguration controller and per-worker cluster
//! duplication.

pub mod cluster;
pub mod config;
pub mod protocol;
pub mod request;
pub mod utils;

pub use cluster::{
    Cluster, Connection, Node, NodeRef, ReconfigStatus, SeedAddr, SlotIndex, SLOT_COUNT,
};
pub use config::{ClusterConfig, Config};
pub use request::{Client, Request};
pub use utils::{crc16, hash_slot};
