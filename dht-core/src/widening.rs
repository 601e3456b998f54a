// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Neighborhood widening.
//!
//! A plain lookup converges on the `k` numerically closest peers. To reach a
//! target population of `s` peers around a key, the widening strategy instead
//! enumerates every peer sharing at least `min_cpl` prefix bits with it,
//! where `min_cpl` is derived from the current network-size estimate. A
//! single lookup converges to distance, not prefix width, so the shell is
//! covered by extra probes aimed into the local buckets at `min_cpl`.

use std::future::Future;
use std::time::Instant;

use itertools::Itertools;

use crate::error::Result;
use crate::keyspace::{KeyspaceId, KEY_BITS};
use crate::lookup::{run_lookup_with_followup, PeerLookupState};
use crate::routing::RoutingTableView;
use crate::transport::{NetworkSizeEstimator, PeerId};

/// Minimum CPL such that the subspace of ids sharing that many bits with a
/// target holds an expected `replication_target` peers out of `network_size`:
/// `ceil(log2(n / s)) - 1`, floored at zero.
pub fn min_cpl_for(network_size: f64, replication_target: usize) -> usize {
    let ratio = network_size / replication_target.max(1) as f64;
    let min_cpl = ratio.log2().ceil() as i64 - 1;
    min_cpl.clamp(0, KEY_BITS as i64 - 1) as usize
}

/// Read the size estimate, gathering data and retrying once on failure.
/// `None` means the caller should fall back to standard placement.
pub(crate) async fn network_size_with_retry(estimator: &dyn NetworkSizeEstimator) -> Option<f64> {
    match estimator.network_size() {
        Ok(n) => Some(n),
        Err(error) => {
            debug!(%error, "network size unavailable, gathering estimator data");
            if let Err(error) = estimator.gather_data().await {
                warn!(%error, "network size estimator failed to gather data");
                return None;
            }
            match estimator.network_size() {
                Ok(n) => Some(n),
                Err(error) => {
                    warn!(%error, "network size still unavailable after gathering");
                    None
                }
            }
        }
    }
}

/// Peers found by the widened enumeration, plus how many lookups it took.
#[derive(Debug)]
pub struct WidenedPeers {
    pub peers: Vec<PeerId>,
    pub lookups: usize,
}

/// Enumerate the peers sharing at least `min_cpl` bits with `target`.
///
/// One lookup aims at the target itself; one more aims at a random point in
/// every local bucket whose CPL equals `min_cpl`. The union of everything the
/// lookups discovered is filtered down to the shell.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn get_peers_with_cpl<F, Fut, S>(
    local: &KeyspaceId,
    routing: &dyn RoutingTableView,
    target: KeyspaceId,
    min_cpl: usize,
    k: usize,
    alpha: usize,
    query_fn: F,
    stop_fn: S,
    deadline: Option<Instant>,
) -> WidenedPeers
where
    F: Fn(PeerId) -> Fut,
    Fut: Future<Output = Result<Vec<PeerId>>>,
    S: Fn() -> bool,
{
    let mut targets = vec![target];
    for cpl in routing.bucket_cpls() {
        if cpl == min_cpl {
            let probe = local.random_within_bucket(cpl, &mut rand::thread_rng());
            targets.push(probe);
        }
    }

    let mut discovered: Vec<PeerId> = Vec::new();
    let lookups = targets.len();
    for lookup_target in targets {
        let seeds = routing.closest_local(&lookup_target, k);
        let result = run_lookup_with_followup(
            lookup_target,
            seeds,
            k,
            alpha,
            &query_fn,
            &stop_fn,
            deadline,
        )
        .await;
        discovered.extend(result.closest_peers);
        discovered.extend(
            result
                .states
                .into_iter()
                .filter(|(_, state)| *state != PeerLookupState::Unreachable)
                .map(|(peer, _)| peer),
        );
    }

    let peers: Vec<PeerId> = discovered
        .into_iter()
        .filter(|p| target.common_prefix_len(&KeyspaceId::from_peer(p)) >= min_cpl)
        .unique()
        .collect();
    debug!(
        shell_target = %target,
        min_cpl,
        lookups,
        found = peers.len(),
        "widened neighborhood enumeration"
    );
    WidenedPeers { peers, lookups }
}
