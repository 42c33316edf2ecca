//! Known peer addresses, persisted as json records in the `Peers` table.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use cfsync_consensus::{Chain, Hash256};
use cfsync_primitives::{sha256, Encoder};
use cfsync_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum PeerDbError {
    Store(StoreError),
    Corrupt(String),
    Poisoned,
}

impl fmt::Display for PeerDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerDbError::Store(err) => write!(f, "{err}"),
            PeerDbError::Corrupt(message) => write!(f, "corrupt peer record: {message}"),
            PeerDbError::Poisoned => write!(f, "peer db lock poisoned"),
        }
    }
}

impl std::error::Error for PeerDbError {}

impl From<StoreError> for PeerDbError {
    fn from(err: StoreError) -> Self {
        PeerDbError::Store(err)
    }
}

impl From<serde_json::Error> for PeerDbError {
    fn from(err: serde_json::Error) -> Self {
        PeerDbError::Corrupt(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Bitcoin,
}

impl Protocol {
    fn id(self) -> u8 {
        match self {
            Protocol::Bitcoin => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkFamily {
    Ipv4,
    Ipv6,
}

impl NetworkFamily {
    pub const ALL: [NetworkFamily; 2] = [NetworkFamily::Ipv4, NetworkFamily::Ipv6];

    fn id(self) -> u8 {
        match self {
            NetworkFamily::Ipv4 => 4,
            NetworkFamily::Ipv6 => 6,
        }
    }
}

mod chain_name {
    use cfsync_consensus::Chain;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chain: &Chain, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(chain.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Chain, D::Error> {
        let name = String::deserialize(deserializer)?;
        Chain::parse(&name).ok_or_else(|| D::Error::custom(format!("unknown chain {name}")))
    }
}

/// A peer address. `protocol`, `network`, `bytes`, `port` and `chain` form
/// the identity; the remaining fields change as we learn about the peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub protocol: Protocol,
    pub network: NetworkFamily,
    pub bytes: Vec<u8>,
    pub port: u16,
    #[serde(with = "chain_name")]
    pub chain: Chain,
    pub services: u64,
    pub previous_services: u64,
    /// Unix seconds of the last successful handshake.
    pub last_connected: Option<u64>,
    pub previous_last_connected: Option<u64>,
}

impl PeerAddress {
    pub fn new(chain: Chain, addr: SocketAddr, services: u64) -> Self {
        let (network, bytes) = match addr.ip() {
            IpAddr::V4(ip) => (NetworkFamily::Ipv4, ip.octets().to_vec()),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip4) => (NetworkFamily::Ipv4, ip4.octets().to_vec()),
                None => (NetworkFamily::Ipv6, ip.octets().to_vec()),
            },
        };
        Self {
            protocol: Protocol::Bitcoin,
            network,
            bytes,
            port: addr.port(),
            chain,
            services,
            previous_services: 0,
            last_connected: None,
            previous_last_connected: None,
        }
    }

    pub fn id(&self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(self.bytes.len() + 8);
        encoder.write_u8(self.protocol.id());
        encoder.write_u8(self.network.id());
        encoder.write_var_bytes(&self.bytes);
        encoder.write_u16_be(self.port);
        encoder.write_u8(self.chain.id());
        sha256(&encoder.into_inner())
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = match self.network {
            NetworkFamily::Ipv4 => {
                let octets: [u8; 4] = self.bytes.as_slice().try_into().ok()?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            NetworkFamily::Ipv6 => {
                let octets: [u8; 16] = self.bytes.as_slice().try_into().ok()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        Some(SocketAddr::new(ip, self.port))
    }

    pub fn has_services(&self, required: u64) -> bool {
        self.services & required == required
    }

    pub fn set_services(&mut self, services: u64) {
        if services != self.services {
            self.previous_services = self.services;
            self.services = services;
        }
    }

    pub fn add_service(&mut self, service: u64) {
        self.set_services(self.services | service);
    }

    pub fn remove_service(&mut self, service: u64) {
        self.set_services(self.services & !service);
    }

    pub fn set_last_connected(&mut self, time: u64) {
        self.previous_last_connected = self.last_connected;
        self.last_connected = Some(time);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "<invalid {:?} address>", self.network),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub struct PeerDb<S> {
    store: S,
    chain: Chain,
    /// Serializes read-modify-write of records; plain reads go straight to the store.
    write: Mutex<()>,
}

impl<S: KeyValueStore> PeerDb<S> {
    pub fn new(store: S, chain: Chain) -> Self {
        Self {
            store,
            chain,
            write: Mutex::new(()),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn load(&self, id: &Hash256) -> Result<Option<PeerAddress>, PeerDbError> {
        match self.store.get(Column::Peers, id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts a new address, or merges services and last-connected time
    /// into the stored record.
    pub fn add_or_update(&self, address: &PeerAddress) -> Result<(), PeerDbError> {
        let _guard = self.write.lock().map_err(|_| PeerDbError::Poisoned)?;
        let id = address.id();
        let record = match self.load(&id)? {
            Some(mut existing) => {
                existing.set_services(address.services);
                if let Some(time) = address.last_connected {
                    if existing.last_connected != Some(time) {
                        existing.set_last_connected(time);
                    }
                }
                existing
            }
            None => address.clone(),
        };
        self.store
            .put(Column::Peers, &id, &serde_json::to_vec(&record)?)?;
        Ok(())
    }

    /// Adds addresses learned from other peers. Known addresses are left as
    /// they are; new ones start with no connection history.
    pub fn import(&self, addresses: &[PeerAddress]) -> Result<usize, PeerDbError> {
        let _guard = self.write.lock().map_err(|_| PeerDbError::Poisoned)?;
        let mut batch = WriteBatch::new();
        let mut seen = HashSet::new();
        for address in addresses {
            if address.chain != self.chain {
                continue;
            }
            let id = address.id();
            if !seen.insert(id) || self.store.contains(Column::Peers, &id)? {
                continue;
            }
            let mut record = address.clone();
            record.last_connected = None;
            record.previous_last_connected = None;
            batch.put(Column::Peers, id, serde_json::to_vec(&record)?);
        }
        let added = batch.len();
        if added > 0 {
            self.store.write_batch(&batch)?;
        }
        Ok(added)
    }

    /// A random stored address matching the protocol, one of `networks`, and
    /// advertising every bit in `services`. Ids in `exclude` are skipped.
    pub fn get(
        &self,
        protocol: Protocol,
        networks: &[NetworkFamily],
        services: u64,
        exclude: &HashSet<Hash256>,
    ) -> Result<Option<PeerAddress>, PeerDbError> {
        let mut candidates = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Peers, &[])? {
            let address: PeerAddress = serde_json::from_slice(&value)?;
            if address.chain != self.chain
                || address.protocol != protocol
                || !networks.contains(&address.network)
                || !address.has_services(services)
                || address.socket_addr().is_none()
            {
                continue;
            }
            let excluded = Hash256::try_from(key.as_slice())
                .map(|id| exclude.contains(&id))
                .unwrap_or(false);
            if !excluded {
                candidates.push(address);
            }
        }
        Ok(candidates.choose(&mut rand::thread_rng()).cloned())
    }

    pub fn len(&self) -> Result<usize, PeerDbError> {
        let mut count = 0usize;
        self.store
            .for_each_prefix(Column::Peers, &[], &mut |_, _| {
                count += 1;
                Ok(())
            })?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, PeerDbError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::services;
    use cfsync_storage::memory::MemoryStore;

    fn addr(text: &str) -> SocketAddr {
        text.parse().expect("socket addr")
    }

    #[test]
    fn identity_ignores_mutable_fields() {
        let mut address = PeerAddress::new(Chain::Bitcoin, addr("192.0.2.1:8333"), 0);
        let id = address.id();
        address.add_service(services::COMPACT_FILTERS);
        address.set_last_connected(1_700_000_000);
        assert_eq!(address.id(), id);
        assert_eq!(address.previous_services, 0);
        assert!(address.has_services(services::COMPACT_FILTERS));

        address.remove_service(services::COMPACT_FILTERS);
        assert_eq!(address.previous_services, services::COMPACT_FILTERS);

        let other_chain = PeerAddress::new(Chain::BitcoinCash, addr("192.0.2.1:8333"), 0);
        assert_ne!(other_chain.id(), id);
        let mapped = PeerAddress::new(Chain::Bitcoin, addr("[::ffff:192.0.2.1]:8333"), 0);
        assert_eq!(mapped.id(), id);
    }

    #[test]
    fn add_or_update_keeps_previous_values() {
        let db = PeerDb::new(MemoryStore::new(), Chain::Bitcoin);
        let mut address = PeerAddress::new(Chain::Bitcoin, addr("192.0.2.1:8333"), services::NETWORK);
        db.add_or_update(&address).expect("insert");

        address.services = services::NETWORK | services::COMPACT_FILTERS;
        address.last_connected = Some(100);
        db.add_or_update(&address).expect("update");

        let stored = db.load(&address.id()).expect("load").expect("present");
        assert_eq!(stored.services, services::NETWORK | services::COMPACT_FILTERS);
        assert_eq!(stored.previous_services, services::NETWORK);
        assert_eq!(stored.last_connected, Some(100));
        assert_eq!(stored.previous_last_connected, None);
        assert_eq!(db.len().expect("len"), 1);
    }

    #[test]
    fn poisoned_write_lock_fails_writes_but_not_reads() {
        let db = PeerDb::new(MemoryStore::new(), Chain::Bitcoin);
        let known = PeerAddress::new(Chain::Bitcoin, addr("192.0.2.1:8333"), services::NETWORK);
        db.add_or_update(&known).expect("insert");

        let crashed = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = db.write.lock();
                    panic!("writer crashed");
                })
                .join()
        });
        assert!(crashed.is_err());

        let fresh = PeerAddress::new(Chain::Bitcoin, addr("192.0.2.9:8333"), services::NETWORK);
        assert!(matches!(db.add_or_update(&fresh), Err(PeerDbError::Poisoned)));
        assert!(matches!(db.import(&[fresh]), Err(PeerDbError::Poisoned)));
        assert!(db.load(&known.id()).expect("load").is_some());
        assert_eq!(db.len().expect("len"), 1);
    }

    #[test]
    fn get_filters_by_services_network_and_exclusions() {
        let db = PeerDb::new(MemoryStore::new(), Chain::Bitcoin);
        let plain = PeerAddress::new(Chain::Bitcoin, addr("192.0.2.1:8333"), services::NETWORK);
        let filters = PeerAddress::new(
            Chain::Bitcoin,
            addr("192.0.2.2:8333"),
            services::NETWORK | services::COMPACT_FILTERS,
        );
        let v6 = PeerAddress::new(
            Chain::Bitcoin,
            addr("[2001:db8::1]:8333"),
            services::NETWORK | services::COMPACT_FILTERS,
        );
        for address in [&plain, &filters, &v6] {
            db.add_or_update(address).expect("insert");
        }

        let none = HashSet::new();
        let found = db
            .get(Protocol::Bitcoin, &[NetworkFamily::Ipv4], services::COMPACT_FILTERS, &none)
            .expect("get");
        assert_eq!(found, Some(filters.clone()));

        let exclude: HashSet<_> = [filters.id()].into_iter().collect();
        assert_eq!(
            db.get(Protocol::Bitcoin, &[NetworkFamily::Ipv4], services::COMPACT_FILTERS, &exclude)
                .expect("get"),
            None
        );
        assert_eq!(
            db.get(Protocol::Bitcoin, &NetworkFamily::ALL, services::COMPACT_FILTERS, &exclude)
                .expect("get"),
            Some(v6)
        );
    }

    #[test]
    fn import_adds_only_new_addresses_without_history() {
        let db = PeerDb::new(MemoryStore::new(), Chain::Bitcoin);
        let mut known = PeerAddress::new(Chain::Bitcoin, addr("192.0.2.1:8333"), services::NETWORK);
        known.last_connected = Some(50);
        db.add_or_update(&known).expect("insert");

        let mut fresh = PeerAddress::new(Chain::Bitcoin, addr("192.0.2.9:8333"), services::NETWORK);
        fresh.last_connected = Some(99);
        let foreign = PeerAddress::new(Chain::BitcoinCash, addr("192.0.2.10:8333"), 0);
        let mut replay = known.clone();
        replay.last_connected = None;

        let added = db
            .import(&[replay, fresh.clone(), fresh.clone(), foreign])
            .expect("import");
        assert_eq!(added, 1);
        assert_eq!(
            db.load(&fresh.id()).expect("load").expect("present").last_connected,
            None
        );
        assert_eq!(
            db.load(&known.id()).expect("load").expect("present").last_connected,
            Some(50)
        );
    }
}
