// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Provider records.
//!
//! `provide` announces the local node as a provider of a key, either to the
//! standard `k` closest peers or, when widening is enabled and a network-size
//! estimate exists, to every peer within the computed CPL radius.
//! `find_providers_async` streams providers from the local store and the
//! network until the requested count is reached. Both run eclipse detection
//! on the neighborhood they touched, for diagnostics only; detection does not
//! change placement.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::dht::Dht;
use crate::error::{Error, Result};
use crate::keyspace::KeyspaceId;
use crate::transport::{PeerId, PeerInfo, RecordKey};
use crate::widening::{get_peers_with_cpl, min_cpl_for, network_size_with_retry};

/// Provider addresses are long-lived compared to plain query gossip.
const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Capacity of the provider stream handed to the consumer.
const PROVIDER_STREAM_CAPACITY: usize = 16;
/// Tail budget reserved for the put phase when plenty of time remains.
const PROVIDE_TAIL_RESERVE: Duration = Duration::from_secs(1);
/// Below this much remaining time, reserve a tenth of it instead.
const PROVIDE_SHORT_DEADLINE: Duration = Duration::from_secs(10);

/// What a provide run did: which peers were selected for placement, how many
/// lookups the selection took, and whether the inner deadline tripped.
#[derive(Debug)]
pub struct ProvideReport {
    pub selected_peers: Vec<PeerId>,
    pub lookups: usize,
    pub deadline_exceeded: bool,
}

impl Dht {
    /// Announce the local node as a provider for `key`.
    ///
    /// With `broadcast` false only the local provider store is updated.
    pub async fn provide(
        &self,
        key: &RecordKey,
        broadcast: bool,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let report = self.provide_inner(key, broadcast, deadline).await?;
        if report.deadline_exceeded {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// `provide`, reporting the selected peers and lookup count. An inner
    /// deadline trip is reported in the result instead of an error.
    pub async fn provide_with_return(
        &self,
        key: &RecordKey,
        broadcast: bool,
        deadline: Option<Instant>,
    ) -> Result<ProvideReport> {
        self.provide_inner(key, broadcast, deadline).await
    }

    async fn provide_inner(
        &self,
        key: &RecordKey,
        broadcast: bool,
        deadline: Option<Instant>,
    ) -> Result<ProvideReport> {
        if !self.inner.config.enable_providers {
            return Err(Error::NotSupported("provider records are disabled"));
        }
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }

        let hash = key.keyspace_id();
        let self_info = self.inner.peer_store.peer_info(&self.inner.local_peer);
        self.inner.provider_store.add_provider(&hash, self_info.clone()).await?;
        if !broadcast {
            return Ok(ProvideReport {
                selected_peers: Vec::new(),
                lookups: 0,
                deadline_exceeded: false,
            });
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded);
        }

        let _provide_guard = self.inner.provide_lock.lock().await;

        // Keep a slice of the budget for the put phase.
        let inner_deadline = deadline.map(|d| {
            let remaining = d.saturating_duration_since(Instant::now());
            let reserve = if remaining < PROVIDE_SHORT_DEADLINE {
                remaining / 10
            } else {
                PROVIDE_TAIL_RESERVE
            };
            d - reserve
        });

        let (selected_peers, lookups) = self.select_provide_targets(hash, inner_deadline).await;
        let deadline_exceeded = inner_deadline.is_some_and(|d| Instant::now() >= d);

        let puts = selected_peers.iter().map(|peer| {
            let self_info = self_info.clone();
            async move {
                if let Err(error) = self
                    .inner
                    .messenger
                    .put_provider(peer, key, self_info)
                    .await
                {
                    debug!(%peer, %error, "put_provider to peer failed");
                }
            }
        });
        let fan_out = futures::future::join_all(puts);
        match deadline {
            Some(d) => tokio::time::timeout_at(tokio::time::Instant::from_std(d), fan_out)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => fan_out.await,
        };

        self.report_neighborhood(&hash, &selected_peers).await;

        Ok(ProvideReport {
            selected_peers,
            lookups,
            deadline_exceeded,
        })
    }

    /// Choose where provider records go: the widened CPL shell when special
    /// provide is on and an estimate is available, the plain `k` closest
    /// otherwise.
    async fn select_provide_targets(
        &self,
        hash: KeyspaceId,
        deadline: Option<Instant>,
    ) -> (Vec<PeerId>, usize) {
        let query_fn = self.closest_query_fn(hash);
        if self.inner.config.special_provide_enabled {
            if let Some(network_size) =
                network_size_with_retry(self.inner.estimator.as_ref()).await
            {
                let min_cpl = min_cpl_for(network_size, self.special_provide_number());
                let widened = get_peers_with_cpl(
                    &self.inner.local_key,
                    self.inner.routing.as_ref(),
                    hash,
                    min_cpl,
                    self.inner.config.bucket_size,
                    self.inner.config.alpha,
                    query_fn,
                    || false,
                    deadline,
                )
                .await;
                return (widened.peers, widened.lookups);
            }
            debug!("no network size estimate, falling back to standard placement");
        }
        let result = self.run_lookup(hash, query_fn, || false, deadline).await;
        (result.closest_peers, 1)
    }

    /// Diagnostic eclipse check of a neighborhood. Never fails the caller.
    async fn report_neighborhood(&self, hash: &KeyspaceId, peers: &[PeerId]) {
        let mut by_distance = peers.to_vec();
        by_distance.sort_by_key(|p| (hash.distance(&KeyspaceId::from_peer(p)), p.clone()));
        match self.detector().await {
            Ok(detector) => match detector.detect(hash, &by_distance) {
                Ok(detection) if detection.eclipsed => warn!(
                    %hash,
                    kl = detection.kl,
                    threshold = detection.threshold,
                    "neighborhood looks eclipsed"
                ),
                Ok(detection) => trace!(%hash, kl = detection.kl, "neighborhood looks clean"),
                Err(error) => debug!(%hash, %error, "eclipse detection skipped"),
            },
            Err(error) => debug!(%hash, %error, "eclipse detector unavailable"),
        }
    }

    /// All providers of `key` the search can find.
    pub async fn find_providers(
        &self,
        key: &RecordKey,
        deadline: Option<Instant>,
    ) -> Result<Vec<PeerInfo>> {
        let mut stream = self.find_providers_async(key, 0, deadline)?;
        let mut providers = Vec::new();
        while let Some(provider) = stream.next().await {
            providers.push(provider);
        }
        Ok(providers)
    }

    /// Stream providers of `key` as they are discovered, stopping after
    /// `count` unique providers. `count == 0` means find all. No provider is
    /// emitted twice.
    pub fn find_providers_async(
        &self,
        key: &RecordKey,
        count: usize,
        deadline: Option<Instant>,
    ) -> Result<ReceiverStream<PeerInfo>> {
        if !self.inner.config.enable_providers {
            return Err(Error::NotSupported("provider records are disabled"));
        }
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let (out_tx, out_rx) = mpsc::channel(PROVIDER_STREAM_CAPACITY);
        let dht = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            dht.drive_find_providers(key, count, deadline, out_tx, None).await;
        });
        Ok(ReceiverStream::new(out_rx))
    }

    /// `find_providers`, additionally returning every peer the search
    /// queried on its path toward the key.
    pub async fn find_providers_return_on_path_nodes(
        &self,
        key: &RecordKey,
        deadline: Option<Instant>,
    ) -> Result<(Vec<PeerInfo>, Vec<PeerId>)> {
        if !self.inner.config.enable_providers {
            return Err(Error::NotSupported("provider records are disabled"));
        }
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let (out_tx, out_rx) = mpsc::channel(PROVIDER_STREAM_CAPACITY);
        // Bounded: the path is drained concurrently, so a slow consumer
        // backpressures the search instead of growing a queue.
        let (path_tx, path_rx) = mpsc::channel(2 * self.inner.config.bucket_size);
        let dht = self.clone();
        let key = key.clone();
        let driver = tokio::spawn(async move {
            dht.drive_find_providers(key, 0, deadline, out_tx, Some(path_tx)).await;
        });

        let providers = ReceiverStream::new(out_rx).collect::<Vec<_>>();
        let path = ReceiverStream::new(path_rx).collect::<Vec<_>>();
        let (providers, path) = tokio::join!(providers, path);
        let _ = driver.await;
        Ok((providers, path))
    }

    async fn drive_find_providers(
        self,
        key: RecordKey,
        count: usize,
        deadline: Option<Instant>,
        out_tx: mpsc::Sender<PeerInfo>,
        path_tx: Option<mpsc::Sender<PeerId>>,
    ) {
        let hash = key.keyspace_id();
        let stop = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(Mutex::new(ProviderSink::new(count)));

        // Local store hits and the network search feed the same stream;
        // neither waits on the other. A count satisfied from the local store
        // stops the lookup through the shared stop flag.
        let local_read = async {
            match self.inner.provider_store.providers(&hash).await {
                Ok(local) => {
                    for info in local {
                        if reserve(&sink, &stop, &info.peer_id) {
                            let _ = out_tx.send(info).await;
                        }
                    }
                }
                Err(error) => debug!(?key, %error, "local provider store read failed"),
            }
        };

        let network_search = async {
            let query_fn = |peer: PeerId| {
                let dht = self.clone();
                let key = key.clone();
                let out_tx = out_tx.clone();
                let path_tx = path_tx.clone();
                let sink = sink.clone();
                let stop = stop.clone();
                async move {
                    if let Some(path_tx) = &path_tx {
                        let _ = path_tx.send(peer.clone()).await;
                    }
                    let (providers, closer) =
                        dht.inner.messenger.get_providers(&peer, &key).await?;
                    for info in providers {
                        if info.peer_id != dht.inner.local_peer && !info.addresses.is_empty() {
                            dht.inner.peer_store.maybe_add_addrs(
                                &info.peer_id,
                                info.addresses.clone(),
                                PROVIDER_ADDR_TTL,
                            );
                        }
                        if reserve(&sink, &stop, &info.peer_id) && out_tx.send(info).await.is_err()
                        {
                            // Consumer went away; stop searching on its behalf.
                            stop.store(true, Ordering::SeqCst);
                        }
                    }
                    Ok(dht.absorb_peers(closer))
                }
            };
            let stop_fn = {
                let stop = stop.clone();
                move || stop.load(Ordering::SeqCst)
            };

            if self.inner.config.special_provide_enabled {
                if let Some(network_size) =
                    network_size_with_retry(self.inner.estimator.as_ref()).await
                {
                    let min_cpl = min_cpl_for(network_size, self.special_provide_number());
                    return get_peers_with_cpl(
                        &self.inner.local_key,
                        self.inner.routing.as_ref(),
                        hash,
                        min_cpl,
                        self.inner.config.bucket_size,
                        self.inner.config.alpha,
                        query_fn,
                        stop_fn,
                        deadline,
                    )
                    .await
                    .peers;
                }
            }
            self.run_lookup(hash, query_fn, stop_fn, deadline)
                .await
                .closest_peers
        };

        let ((), visited) = tokio::join!(local_read, network_search);
        self.report_neighborhood(&hash, &visited).await;
    }
}

/// Dedup and count bookkeeping for a provider search.
struct ProviderSink {
    seen: HashSet<PeerId>,
    emitted: usize,
    count: usize,
}

impl ProviderSink {
    fn new(count: usize) -> Self {
        Self {
            seen: HashSet::new(),
            emitted: 0,
            count,
        }
    }
}

/// Reserve an emission slot for `peer`. Sets `stop` once the requested count
/// has been handed out. The send itself happens outside the lock.
fn reserve(sink: &Mutex<ProviderSink>, stop: &AtomicBool, peer: &PeerId) -> bool {
    let mut sink = sink.lock().expect("provider sink poisoned");
    if sink.count > 0 && sink.emitted >= sink.count {
        return false;
    }
    if !sink.seen.insert(peer.clone()) {
        return false;
    }
    sink.emitted += 1;
    if sink.count > 0 && sink.emitted >= sink.count {
        stop.store(true, Ordering::SeqCst);
    }
    true
}
