// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The DHT handle.
//!
//! [`Dht`] owns the injected capabilities and exposes the overlay operations.
//! It is cheap to clone; clones share the same capabilities, configuration
//! and provide lock.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;

use crate::config::DhtConfig;
use crate::detector::{Detection, EclipseDetector};
use crate::error::{Error, Result};
use crate::keyspace::{KeyspaceId, KEY_BITS};
use crate::lookup::{run_lookup_with_followup, LookupResult, PeerLookupState};
use crate::routing::RoutingTableView;
use crate::store::{
    MemoryPeerAddressStore, MemoryProviderStore, MemoryRecordStore, PeerAddressStore,
    ProviderStore, RecordStore,
};
use crate::transport::{Connectedness, Messenger, Network, NetworkSizeEstimator, PeerId, PeerInfo};
use crate::validator::Validator;
use crate::widening::network_size_with_retry;

/// How long addresses learned from lookup responses are worth keeping.
pub(crate) const QUERY_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

pub(crate) struct DhtInner {
    pub(crate) local_peer: PeerId,
    pub(crate) local_key: KeyspaceId,
    pub(crate) config: DhtConfig,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) record_store: Arc<dyn RecordStore>,
    pub(crate) provider_store: Arc<dyn ProviderStore>,
    pub(crate) peer_store: Arc<dyn PeerAddressStore>,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) estimator: Arc<dyn NetworkSizeEstimator>,
    pub(crate) routing: Arc<dyn RoutingTableView>,
    /// Providing is a heavy, one-at-a-time operation.
    pub(crate) provide_lock: Mutex<()>,
    pub(crate) special_provide_number: AtomicUsize,
}

/// Handle to the routing core.
#[derive(Clone)]
pub struct Dht {
    pub(crate) inner: Arc<DhtInner>,
}

impl Dht {
    pub fn builder(
        local_peer: PeerId,
        messenger: Arc<dyn Messenger>,
        routing: Arc<dyn RoutingTableView>,
        network: Arc<dyn Network>,
        estimator: Arc<dyn NetworkSizeEstimator>,
        validator: Arc<dyn Validator>,
    ) -> DhtBuilder {
        DhtBuilder {
            local_peer,
            messenger,
            routing,
            network,
            estimator,
            validator,
            record_store: None,
            provider_store: None,
            peer_store: None,
            config: DhtConfig::default(),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Adjust the widened-provide replication target at runtime.
    pub fn set_special_provide_number(&self, n: usize) {
        self.inner.special_provide_number.store(n, Ordering::SeqCst);
    }

    pub(crate) fn special_provide_number(&self) -> usize {
        self.inner.special_provide_number.load(Ordering::SeqCst)
    }

    /// Fold response peers into the address book and return their ids, with
    /// the own id filtered out.
    pub(crate) fn absorb_peers(&self, peers: Vec<PeerInfo>) -> Vec<PeerId> {
        peers
            .into_iter()
            .filter(|info| info.peer_id != self.inner.local_peer)
            .map(|info| {
                let PeerInfo { peer_id, addresses } = info;
                if !addresses.is_empty() {
                    self.inner
                        .peer_store
                        .maybe_add_addrs(&peer_id, addresses, QUERY_ADDR_TTL);
                }
                peer_id
            })
            .collect()
    }

    /// Query function asking each peer for the peers it knows closest to
    /// `target`.
    pub(crate) fn closest_query_fn(
        &self,
        target: KeyspaceId,
    ) -> impl Fn(PeerId) -> BoxFuture<'static, Result<Vec<PeerId>>> {
        let dht = self.clone();
        move |peer: PeerId| {
            let dht = dht.clone();
            async move {
                let closer = dht.inner.messenger.get_closest_peers(&peer, &target).await?;
                Ok(dht.absorb_peers(closer))
            }
            .boxed()
        }
    }

    /// Run an iterative lookup seeded from the local routing view. A lookup
    /// that ran to natural completion counts as a refresh of the target's
    /// bucket.
    pub(crate) async fn run_lookup<F, Fut, S>(
        &self,
        target: KeyspaceId,
        query_fn: F,
        stop_fn: S,
        deadline: Option<Instant>,
    ) -> LookupResult
    where
        F: Fn(PeerId) -> Fut,
        Fut: Future<Output = Result<Vec<PeerId>>>,
        S: Fn() -> bool,
    {
        let k = self.inner.config.bucket_size;
        let seeds = self.inner.routing.closest_local(&target, k);
        let result = run_lookup_with_followup(
            target,
            seeds,
            k,
            self.inner.config.alpha,
            query_fn,
            stop_fn,
            deadline,
        )
        .await;
        if result.completed {
            let bucket = self.inner.local_key.common_prefix_len(&target).min(KEY_BITS - 1);
            self.inner.routing.reset_refresh_at(bucket, Instant::now());
        }
        result
    }

    /// The `k` closest peers to `key` the network knows of.
    pub async fn get_closest_peers(
        &self,
        key: &[u8],
        deadline: Option<Instant>,
    ) -> Result<Vec<PeerId>> {
        let target = KeyspaceId::hash(key);
        let query_fn = self.closest_query_fn(target);
        let result = self.run_lookup(target, query_fn, || false, deadline).await;
        Ok(result.closest_peers)
    }

    /// Locate a peer. Returns immediately when already connected; otherwise
    /// walks the overlay toward the peer's keyspace position, stopping early
    /// once a connection exists.
    pub async fn find_peer(&self, id: &PeerId, deadline: Option<Instant>) -> Result<PeerInfo> {
        if self.inner.network.connectedness(id) == Connectedness::Connected {
            return Ok(self.inner.peer_store.peer_info(id));
        }

        let target = KeyspaceId::from_peer(id);
        let query_fn = self.closest_query_fn(target);
        let stop_fn = {
            let network = self.inner.network.clone();
            let id = id.clone();
            move || network.connectedness(&id) == Connectedness::Connected
        };
        let result = self.run_lookup(target, query_fn, stop_fn, deadline).await;

        let dialed = result.states.get(id) == Some(&PeerLookupState::Queried);
        if dialed || self.inner.network.connectedness(id) == Connectedness::Connected {
            Ok(self.inner.peer_store.peer_info(id))
        } else {
            Err(Error::NotFound)
        }
    }

    /// Test a returned neighborhood of `target` against the expected CPL
    /// distribution for the current network-size estimate.
    pub async fn eclipse_detection(
        &self,
        target: &KeyspaceId,
        peers: &[PeerId],
    ) -> Result<Detection> {
        self.detector().await?.detect(target, peers)
    }

    /// A detector calibrated to the current network-size estimate.
    pub(crate) async fn detector(&self) -> Result<EclipseDetector> {
        let network_size = network_size_with_retry(self.inner.estimator.as_ref())
            .await
            .ok_or_else(|| Error::DetectorUnavailable {
                reason: "no network size estimate".into(),
            })?;
        EclipseDetector::new(network_size, self.inner.config.eclipse_detection_k)
    }
}

/// Assembles a [`Dht`] from its capabilities. Stores default to the in-memory
/// implementations.
pub struct DhtBuilder {
    local_peer: PeerId,
    messenger: Arc<dyn Messenger>,
    routing: Arc<dyn RoutingTableView>,
    network: Arc<dyn Network>,
    estimator: Arc<dyn NetworkSizeEstimator>,
    validator: Arc<dyn Validator>,
    record_store: Option<Arc<dyn RecordStore>>,
    provider_store: Option<Arc<dyn ProviderStore>>,
    peer_store: Option<Arc<dyn PeerAddressStore>>,
    config: DhtConfig,
}

impl DhtBuilder {
    pub fn config(mut self, config: DhtConfig) -> Self {
        self.config = config;
        self
    }

    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    pub fn provider_store(mut self, store: Arc<dyn ProviderStore>) -> Self {
        self.provider_store = Some(store);
        self
    }

    pub fn peer_store(mut self, store: Arc<dyn PeerAddressStore>) -> Self {
        self.peer_store = Some(store);
        self
    }

    pub fn build(self) -> Dht {
        let local_key = KeyspaceId::from_peer(&self.local_peer);
        let special_provide_number = AtomicUsize::new(self.config.special_provide_number);
        Dht {
            inner: Arc::new(DhtInner {
                local_peer: self.local_peer,
                local_key,
                config: self.config,
                messenger: self.messenger,
                validator: self.validator,
                record_store: self
                    .record_store
                    .unwrap_or_else(|| Arc::new(MemoryRecordStore::new())),
                provider_store: self
                    .provider_store
                    .unwrap_or_else(|| Arc::new(MemoryProviderStore::new())),
                peer_store: self
                    .peer_store
                    .unwrap_or_else(|| Arc::new(MemoryPeerAddressStore::new())),
                network: self.network,
                estimator: self.estimator,
                routing: self.routing,
                provide_lock: Mutex::new(()),
                special_provide_number,
            }),
        }
    }
}
