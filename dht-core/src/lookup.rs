// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The iterative lookup engine.
//!
//! A lookup converges on the `k` peers closest to a target by repeatedly
//! querying the closest peers it has heard of, `alpha` at a time. The caller
//! supplies the per-peer query function, which returns closer peers and may
//! stream records or providers upward as a side effect, and a stop predicate
//! to cut the search short once it has what it needs.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::timeout_at;

use crate::error::Result;
use crate::keyspace::{Distance, KeyspaceId};
use crate::transport::PeerId;

/// State of a single peer within one lookup.
///
/// `Heard -> Waiting -> {Queried, Unreachable}`; terminal states are never
/// left within the same lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerLookupState {
    /// Seen in some response, not yet contacted.
    Heard,
    /// Query dispatched, response outstanding.
    Waiting,
    /// Responded successfully.
    Queried,
    /// Failed to respond.
    Unreachable,
}

/// Outcome of a lookup.
#[derive(Debug)]
pub struct LookupResult {
    /// The closest reachable peers discovered, ascending by distance to the
    /// target. When `completed` is true these are the `k` best peers the
    /// engine could reach, all of them queried.
    pub closest_peers: Vec<PeerId>,
    /// Final state of every peer the lookup touched.
    pub states: HashMap<PeerId, PeerLookupState>,
    /// True iff the natural termination condition was met, as opposed to the
    /// stop predicate firing or the deadline expiring.
    pub completed: bool,
}

impl LookupResult {
    /// Every peer that responded during the lookup, including peers that
    /// closer discoveries later pushed out of `closest_peers`.
    pub fn queried_peers(&self) -> Vec<PeerId> {
        self.states
            .iter()
            .filter(|(_, state)| **state == PeerLookupState::Queried)
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

/// Peer set of a single lookup, ordered by XOR distance to the target with
/// lexicographic peer-id tie-break.
pub(crate) struct LookupState {
    target: KeyspaceId,
    k: usize,
    entries: BTreeMap<(Distance, PeerId), PeerLookupState>,
}

impl LookupState {
    pub(crate) fn new(target: KeyspaceId, k: usize) -> Self {
        Self {
            target,
            k,
            entries: BTreeMap::new(),
        }
    }

    fn order_key(&self, peer: &PeerId) -> (Distance, PeerId) {
        let id = KeyspaceId::from_peer(peer);
        (self.target.distance(&id), peer.clone())
    }

    /// Fold newly heard peers into the set. Already-known peers keep their
    /// state.
    pub(crate) fn add_heard(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        for peer in peers {
            let key = self.order_key(&peer);
            self.entries.entry(key).or_insert(PeerLookupState::Heard);
        }
    }

    pub(crate) fn set_state(&mut self, peer: &PeerId, state: PeerLookupState) {
        let key = self.order_key(peer);
        if let Some(entry) = self.entries.get_mut(&key) {
            *entry = state;
        }
    }

    pub(crate) fn state_of(&self, peer: &PeerId) -> Option<PeerLookupState> {
        self.entries.get(&self.order_key(peer)).copied()
    }

    /// The closest peer still in `Heard`, if any.
    pub(crate) fn next_to_query(&self) -> Option<PeerId> {
        self.entries
            .iter()
            .find(|(_, state)| **state == PeerLookupState::Heard)
            .map(|((_, peer), _)| peer.clone())
    }

    /// The `n` closest peers not marked unreachable, with their states.
    fn closest_active(&self, n: usize) -> Vec<(PeerId, PeerLookupState)> {
        self.entries
            .iter()
            .filter(|(_, state)| **state != PeerLookupState::Unreachable)
            .take(n)
            .map(|((_, peer), state)| (peer.clone(), *state))
            .collect()
    }

    /// Natural termination: the `k` closest reachable peers have all been
    /// queried, which implies no strictly closer heard peer remains.
    pub(crate) fn is_done(&self) -> bool {
        self.closest_active(self.k)
            .iter()
            .all(|(_, state)| *state == PeerLookupState::Queried)
    }

    /// Top-`k` reachable peers that were never queried; the follow-up set.
    fn closest_unqueried(&self) -> Vec<PeerId> {
        self.closest_active(self.k)
            .into_iter()
            .filter(|(_, state)| *state != PeerLookupState::Queried)
            .map(|(peer, _)| peer)
            .collect()
    }

    fn into_result(self, completed: bool) -> LookupResult {
        let closest_peers = self
            .closest_active(self.k)
            .into_iter()
            .map(|(peer, _)| peer)
            .collect();
        let states = self
            .entries
            .into_iter()
            .map(|((_, peer), state)| (peer, state))
            .collect();
        LookupResult {
            closest_peers,
            states,
            completed,
        }
    }
}

/// Run an iterative lookup toward `target`, then a follow-up pass that
/// queries any top-`k` peers the main phase left unqueried.
///
/// Per-peer failures are isolated: a failing peer is marked unreachable and
/// the lookup continues. The lookup as a whole only ends early through the
/// stop predicate or the deadline.
pub async fn run_lookup_with_followup<F, Fut, S>(
    target: KeyspaceId,
    seeds: Vec<PeerId>,
    k: usize,
    alpha: usize,
    query_fn: F,
    stop_fn: S,
    deadline: Option<Instant>,
) -> LookupResult
where
    F: Fn(PeerId) -> Fut,
    Fut: Future<Output = Result<Vec<PeerId>>>,
    S: Fn() -> bool,
{
    let mut state = LookupState::new(target, k);
    state.add_heard(seeds);

    let mut stopped = false;
    let mut timed_out = false;

    let mut in_flight = FuturesUnordered::new();
    loop {
        if stop_fn() {
            stopped = true;
            break;
        }
        while in_flight.len() < alpha {
            let Some(peer) = state.next_to_query() else {
                break;
            };
            state.set_state(&peer, PeerLookupState::Waiting);
            let fut = query_fn(peer.clone());
            in_flight.push(async move { (peer, fut.await) });
        }
        if in_flight.is_empty() {
            // Starved: nothing outstanding and nothing left to ask.
            break;
        }
        match next_response(&mut in_flight, deadline).await {
            Ok(Some((peer, Ok(closer)))) => {
                state.set_state(&peer, PeerLookupState::Queried);
                state.add_heard(closer);
            }
            Ok(Some((peer, Err(error)))) => {
                debug!(%peer, %error, "lookup query failed, marking peer unreachable");
                state.set_state(&peer, PeerLookupState::Unreachable);
            }
            Ok(None) => break,
            Err(()) => {
                timed_out = true;
                break;
            }
        }
        if state.is_done() {
            break;
        }
    }
    // Abandon outstanding queries; their peers stay in Waiting.
    drop(in_flight);

    if stopped || timed_out {
        return state.into_result(false);
    }

    let followup = state.closest_unqueried();
    if followup.is_empty() {
        return state.into_result(true);
    }
    if stop_fn() {
        return state.into_result(false);
    }

    trace!(lookup_target = %target, peers = followup.len(), "lookup follow-up phase");
    let mut in_flight = FuturesUnordered::new();
    for peer in followup {
        state.set_state(&peer, PeerLookupState::Waiting);
        let fut = query_fn(peer.clone());
        in_flight.push(async move { (peer, fut.await) });
    }
    loop {
        match next_response(&mut in_flight, deadline).await {
            Ok(Some((peer, Ok(closer)))) => {
                state.set_state(&peer, PeerLookupState::Queried);
                state.add_heard(closer);
            }
            Ok(Some((peer, Err(error)))) => {
                debug!(%peer, %error, "follow-up query failed, marking peer unreachable");
                state.set_state(&peer, PeerLookupState::Unreachable);
            }
            Ok(None) => break,
            Err(()) => {
                timed_out = true;
                break;
            }
        }
    }

    state.into_result(!timed_out)
}

type Response = (PeerId, Result<Vec<PeerId>>);

/// Next completed query, or `Err(())` when the deadline expires first.
async fn next_response<St>(in_flight: &mut St, deadline: Option<Instant>) -> Result<Option<Response>, ()>
where
    St: futures::Stream<Item = Response> + Unpin,
{
    match deadline {
        Some(d) => timeout_at(tokio::time::Instant::from_std(d), in_flight.next())
            .await
            .map_err(|_| ()),
        None => Ok(in_flight.next().await),
    }
}
