//! Registry of running per-chain clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cfsync_consensus::{chain_params, Chain};
use cfsync_log::{log_info, log_warn};
use cfsync_storage::fjall::FjallStore;
use cfsync_storage::memory::MemoryStore;

use crate::config::Backend;
use crate::network::{Network, NetworkConfig, NetworkStatus};
use crate::Store;

/// Opens the store for one chain. Each chain gets its own directory under
/// `data_dir` so chains never share tables.
pub fn open_store(backend: Backend, data_dir: &Path, chain: Chain) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
        Backend::Fjall => {
            let path = data_dir.join(chain.as_str());
            std::fs::create_dir_all(&path)
                .map_err(|err| format!("failed to create {}: {err}", path.display()))?;
            let store = FjallStore::open(&path).map_err(|err| err.to_string())?;
            Ok(Arc::new(store))
        }
    }
}

pub struct Clients {
    backend: Backend,
    data_dir: PathBuf,
    networks: Mutex<HashMap<Chain, Network>>,
}

impl Clients {
    pub fn new(backend: Backend, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            data_dir: data_dir.into(),
            networks: Mutex::new(HashMap::new()),
        }
    }

    /// Starts `chain` with default tunables. False if it is already running
    /// or fails to start.
    pub fn start(&self, chain: Chain, seednode: Option<SocketAddr>) -> bool {
        let mut config = NetworkConfig::new(&chain_params(chain));
        config.peers.default_peer = seednode;
        match self.start_with(chain, config) {
            Ok(started) => started,
            Err(err) => {
                log_warn!("failed to start {chain} client: {err}");
                false
            }
        }
    }

    pub fn start_with(&self, chain: Chain, config: NetworkConfig) -> Result<bool, String> {
        let mut networks = self
            .networks
            .lock()
            .map_err(|_| "clients lock poisoned".to_string())?;
        if networks.contains_key(&chain) {
            return Ok(false);
        }
        let store = open_store(self.backend, &self.data_dir, chain)?;
        let network = Network::start(chain_params(chain), store, config)?;
        networks.insert(chain, network);
        Ok(true)
    }

    pub async fn stop(&self, chain: Chain) -> bool {
        let network = self
            .networks
            .lock()
            .ok()
            .and_then(|mut networks| networks.remove(&chain));
        match network {
            Some(network) => {
                network.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let networks = self
            .networks
            .lock()
            .map(|mut networks| networks.drain().map(|(_, network)| network).collect::<Vec<_>>())
            .unwrap_or_default();
        for network in networks {
            network.shutdown().await;
        }
        log_info!("all clients stopped");
    }

    pub fn running(&self) -> Vec<Chain> {
        let mut chains = self
            .networks
            .lock()
            .map(|networks| networks.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        chains.sort();
        chains
    }

    pub async fn status(&self, chain: Chain) -> Option<NetworkStatus> {
        let handle = self
            .networks
            .lock()
            .ok()?
            .get(&chain)
            .map(Network::handle)?;
        handle.status().await
    }

    pub fn is_synchronized(&self, chain: Chain) -> Option<bool> {
        self.networks
            .lock()
            .ok()?
            .get(&chain)
            .map(Network::is_synchronized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_client_per_chain() {
        let clients = Clients::new(Backend::Memory, "unused");
        assert!(clients.start(Chain::Regtest, None));
        assert!(!clients.start(Chain::Regtest, None));
        assert_eq!(clients.running(), vec![Chain::Regtest]);

        let status = clients.status(Chain::Regtest).await.expect("status");
        assert_eq!(status.chain, Chain::Regtest);
        assert_eq!(status.local_height, 0);
        assert_eq!(clients.is_synchronized(Chain::Regtest), Some(true));
        assert!(clients.status(Chain::Bitcoin).await.is_none());

        assert!(clients.stop(Chain::Regtest).await);
        assert!(!clients.stop(Chain::Regtest).await);
        assert!(clients.running().is_empty());
    }
}
