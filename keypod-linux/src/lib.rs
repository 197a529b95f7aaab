//! KeyPod daemon for Linux: LAN discovery, encrypted peer links, per-peer pairing sessions and
//! redb-backed key pools.

pub mod actor;
pub mod beacon;
pub mod config;
pub mod merger;
pub mod node;
pub mod redb_store;
pub mod transport;

pub use config::Config;
pub use node::{Node, NodeError, NodeOptions, PeerSummary};
