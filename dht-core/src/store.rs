// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Storage capabilities consumed by the routing core, with in-memory
//! implementations suitable for tests and embedders without a datastore.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::keyspace::KeyspaceId;
use crate::transport::{PeerAddress, PeerId, PeerInfo, Record, RecordKey};

/// Local record storage. The core guarantees it never writes a record that
/// failed validation.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_local(&self, key: &RecordKey) -> Result<Option<Record>>;
    async fn put_local(&self, record: Record) -> Result<()>;
}

/// Provider entries, addressed by the content hash derived from a key.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn add_provider(&self, hash: &KeyspaceId, provider: PeerInfo) -> Result<()>;
    async fn providers(&self, hash: &KeyspaceId) -> Result<Vec<PeerInfo>>;
}

/// Known addresses per peer.
pub trait PeerAddressStore: Send + Sync {
    /// Record addresses for `peer` unless better ones are already known.
    fn maybe_add_addrs(&self, peer: &PeerId, addrs: Vec<PeerAddress>, ttl: Duration);

    /// Addresses currently known for `peer`. The entry may be empty.
    fn peer_info(&self, peer: &PeerId) -> PeerInfo;
}

/// Hash-map backed record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<RecordKey, Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_local(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.records.lock().expect("record store poisoned").get(key).cloned())
    }

    async fn put_local(&self, record: Record) -> Result<()> {
        self.records
            .lock()
            .expect("record store poisoned")
            .insert(record.key.clone(), record);
        Ok(())
    }
}

/// Hash-map backed provider store. Entries are deduplicated by peer id.
#[derive(Default)]
pub struct MemoryProviderStore {
    providers: Mutex<HashMap<KeyspaceId, Vec<PeerInfo>>>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderStore for MemoryProviderStore {
    async fn add_provider(&self, hash: &KeyspaceId, provider: PeerInfo) -> Result<()> {
        let mut providers = self.providers.lock().expect("provider store poisoned");
        let entries = providers.entry(*hash).or_default();
        match entries.iter_mut().find(|e| e.peer_id == provider.peer_id) {
            Some(existing) => *existing = provider,
            None => entries.push(provider),
        }
        Ok(())
    }

    async fn providers(&self, hash: &KeyspaceId) -> Result<Vec<PeerInfo>> {
        Ok(self
            .providers
            .lock()
            .expect("provider store poisoned")
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }
}

/// Hash-map backed address book. TTLs are accepted and ignored; eviction is a
/// host concern.
#[derive(Default)]
pub struct MemoryPeerAddressStore {
    addrs: Mutex<HashMap<PeerId, Vec<PeerAddress>>>,
}

impl MemoryPeerAddressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerAddressStore for MemoryPeerAddressStore {
    fn maybe_add_addrs(&self, peer: &PeerId, addrs: Vec<PeerAddress>, _ttl: Duration) {
        let mut known = self.addrs.lock().expect("address store poisoned");
        let entry = known.entry(peer.clone()).or_default();
        for addr in addrs {
            if !entry.contains(&addr) {
                entry.push(addr);
            }
        }
    }

    fn peer_info(&self, peer: &PeerId) -> PeerInfo {
        let addrs = self
            .addrs
            .lock()
            .expect("address store poisoned")
            .get(peer)
            .cloned()
            .unwrap_or_default();
        PeerInfo::new(peer.clone(), addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn record_store_round_trip() -> eyre::Result<()> {
        let store = MemoryRecordStore::new();
        let key = RecordKey::new(&b"/v/k"[..]);
        assert!(store.get_local(&key).await?.is_none());

        let record = Record::new(key.clone(), Bytes::from_static(b"v1")).received_now();
        store.put_local(record).await?;
        let got = store.get_local(&key).await?.ok_or_else(|| eyre::eyre!("missing"))?;
        assert_eq!(got.value, Bytes::from_static(b"v1"));
        assert!(got.time_received.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn provider_store_dedups_by_peer() -> eyre::Result<()> {
        let store = MemoryProviderStore::new();
        let hash = KeyspaceId::hash(b"content");
        let peer = PeerId::new(vec![1; 8]);

        let first = PeerInfo::new(peer.clone(), vec![PeerAddress::new("tcp", "10.0.0.1:4100")]);
        let second = PeerInfo::new(peer.clone(), vec![PeerAddress::new("tcp", "10.0.0.2:4100")]);
        store.add_provider(&hash, first).await?;
        store.add_provider(&hash, second.clone()).await?;

        let providers = store.providers(&hash).await?;
        assert_eq!(providers, vec![second]);
        Ok(())
    }

    #[test]
    fn address_store_merges_addrs() {
        let store = MemoryPeerAddressStore::new();
        let peer = PeerId::new(vec![2; 8]);
        let ttl = Duration::from_secs(60);

        store.maybe_add_addrs(&peer, vec![PeerAddress::new("tcp", "10.0.0.1:4100")], ttl);
        store.maybe_add_addrs(
            &peer,
            vec![
                PeerAddress::new("tcp", "10.0.0.1:4100"),
                PeerAddress::new("quic", "10.0.0.1:4101"),
            ],
            ttl,
        );

        assert_eq!(store.peer_info(&peer).addresses.len(), 2);
    }
}
