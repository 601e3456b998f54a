// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Read-only view of the routing table.
//!
//! Bucket maintenance (eviction, liveness probing, refresh scheduling) is a
//! host concern; the core only needs to seed lookups from local knowledge,
//! note refresh times after a completed lookup, and enumerate which CPL
//! buckets are populated. [`RoutingTable`] is an in-memory implementation of
//! that view for tests and simple embedders.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::keyspace::{KeyspaceId, KEY_BITS};
use crate::transport::PeerId;

/// The slice of routing-table behavior the core depends on. Implementations
/// must be safe to share across concurrent lookups.
pub trait RoutingTableView: Send + Sync {
    /// Up to `n` locally-known peers, strictly ascending by distance to
    /// `target`.
    fn closest_local(&self, target: &KeyspaceId, n: usize) -> Vec<PeerId>;

    /// Note that the bucket at `cpl` was effectively refreshed at `now`.
    fn reset_refresh_at(&self, cpl: usize, now: Instant);

    /// CPLs of the non-empty buckets, ascending.
    fn bucket_cpls(&self) -> Vec<usize>;
}

struct Bucket {
    peers: Vec<PeerId>,
    refreshed_at: Instant,
}

/// In-memory routing table bucketed by CPL to the local id.
pub struct RoutingTable {
    local: KeyspaceId,
    buckets: Mutex<BTreeMap<usize, Bucket>>,
}

impl RoutingTable {
    pub fn new(local: KeyspaceId) -> Self {
        Self {
            local,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record `peer` in the bucket matching its CPL to the local id. The own
    /// id is ignored.
    pub fn insert(&self, peer: PeerId) {
        let cpl = self.local.common_prefix_len(&KeyspaceId::from_peer(&peer));
        if cpl == KEY_BITS {
            return;
        }
        let mut buckets = self.buckets.lock().expect("routing table poisoned");
        let bucket = buckets.entry(cpl).or_insert_with(|| Bucket {
            peers: Vec::new(),
            refreshed_at: Instant::now(),
        });
        if !bucket.peers.contains(&peer) {
            bucket.peers.push(peer);
        }
    }

    pub fn refreshed_at(&self, cpl: usize) -> Option<Instant> {
        self.buckets
            .lock()
            .expect("routing table poisoned")
            .get(&cpl)
            .map(|b| b.refreshed_at)
    }

    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .expect("routing table poisoned")
            .values()
            .map(|b| b.peers.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RoutingTableView for RoutingTable {
    fn closest_local(&self, target: &KeyspaceId, n: usize) -> Vec<PeerId> {
        let buckets = self.buckets.lock().expect("routing table poisoned");
        let mut peers: Vec<(crate::keyspace::Distance, PeerId)> = buckets
            .values()
            .flat_map(|b| b.peers.iter())
            .map(|p| (target.distance(&KeyspaceId::from_peer(p)), p.clone()))
            .collect();
        peers.sort();
        peers.into_iter().take(n).map(|(_, p)| p).collect()
    }

    fn reset_refresh_at(&self, cpl: usize, now: Instant) {
        let mut buckets = self.buckets.lock().expect("routing table poisoned");
        if let Some(bucket) = buckets.get_mut(&cpl) {
            bucket.refreshed_at = now;
        }
    }

    fn bucket_cpls(&self) -> Vec<usize> {
        self.buckets
            .lock()
            .expect("routing table poisoned")
            .iter()
            .filter(|(_, b)| !b.peers.is_empty())
            .map(|(cpl, _)| *cpl)
            .collect()
    }
}
