//! Peer-to-peer header and compact filter sync client.
//!
//! [`wire`] and [`messages`] speak the peer protocol, [`peer`] drives one
//! connection, [`peer_manager`] keeps a pool of them and [`network`]
//! coordinates sync for one chain. [`clients::Clients`] runs one network
//! per chain.

use std::sync::Arc;

use cfsync_storage::KeyValueStore;

pub mod clients;
pub mod config;
pub mod messages;
pub mod network;
pub mod peer;
pub mod peer_db;
pub mod peer_manager;
pub mod wire;

pub use clients::Clients;
pub use network::{Network, NetworkConfig, NetworkHandle, NetworkStatus};

/// Shared storage backend behind every store of a chain.
pub type Store = Arc<dyn KeyValueStore>;
