// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Value storage and retrieval.
//!
//! `put_value` writes locally and replicates to the `k` closest peers.
//! `search_value` streams every improvement over the best value seen so far
//! while the lookup walks toward the key, and repairs stale peers once the
//! search ends. `get_value` is the quorum-gated convenience wrapper.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

use crate::dht::Dht;
use crate::error::{Error, Result};
use crate::transport::{PeerId, Record, RecordKey, ReceivedValue};
use crate::validator::Validator;

/// Per-peer timeout for corrective writes, detached from the parent deadline.
const CORRECTIVE_PUT_TIMEOUT: Duration = Duration::from_secs(30);
/// Capacity of the stream handed to the consumer.
const VALUE_STREAM_CAPACITY: usize = 8;
/// Capacity of the internal pipeline between query tasks and the selector.
const VALUE_PIPELINE_CAPACITY: usize = 32;

/// Options for `get_value` / `search_value`.
#[derive(Clone, Debug, Default)]
pub struct GetValueConfig {
    /// Stop the search once this many responses have been processed.
    /// `get_value` substitutes the configured default when unset.
    pub quorum: Option<usize>,
    pub deadline: Option<Instant>,
}

/// Options for `put_value`.
#[derive(Clone, Debug, Default)]
pub struct PutValueConfig {
    pub deadline: Option<Instant>,
}

impl Dht {
    /// Store `value` under `key`, locally and on the `k` closest peers.
    ///
    /// Refuses the write when the local store already holds a strictly
    /// better value; equal-rank ties go to the newer write.
    pub async fn put_value(
        &self,
        key: RecordKey,
        value: Bytes,
        cfg: PutValueConfig,
    ) -> Result<()> {
        if !self.inner.config.enable_values {
            return Err(Error::NotSupported("value records are disabled"));
        }
        self.inner.validator.validate(&key, &value)?;

        if let Some(local) = self.inner.record_store.get_local(&key).await? {
            if local.value != value {
                let winner = self
                    .inner
                    .validator
                    .select(&key, &[value.clone(), local.value.clone()])?;
                if winner != 0 {
                    debug!(?key, "refusing to overwrite a better local value");
                    return Err(Error::StaleWrite);
                }
            }
        }
        self.inner
            .record_store
            .put_local(Record::new(key.clone(), value.clone()).received_now())
            .await?;

        let target = key.keyspace_id();
        let query_fn = self.closest_query_fn(target);
        let lookup = self.run_lookup(target, query_fn, || false, cfg.deadline).await;

        let record = Record::new(key.clone(), value);
        let puts = lookup.closest_peers.iter().map(|peer| {
            let record = record.clone();
            async move {
                if let Err(error) = self.inner.messenger.put_value(peer, record).await {
                    debug!(%peer, %error, "put_value to peer failed");
                }
            }
        });
        let fan_out = futures::future::join_all(puts);
        match cfg.deadline {
            Some(d) => tokio::time::timeout_at(tokio::time::Instant::from_std(d), fan_out)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => fan_out.await,
        };
        Ok(())
    }

    /// Search the network for values under `key`, streaming each value that
    /// improves on the best seen so far. The emitted sequence is monotone
    /// non-decreasing under the validator's ranking.
    pub fn search_value(
        &self,
        key: RecordKey,
        cfg: GetValueConfig,
    ) -> Result<ReceiverStream<Bytes>> {
        if !self.inner.config.enable_values {
            return Err(Error::NotSupported("value records are disabled"));
        }
        let (out_tx, out_rx) = mpsc::channel(VALUE_STREAM_CAPACITY);
        let dht = self.clone();
        tokio::spawn(async move {
            dht.drive_search(key, cfg, out_tx).await;
        });
        Ok(ReceiverStream::new(out_rx))
    }

    /// Fetch the best value under `key`, applying the default quorum when
    /// none is given.
    pub async fn get_value(&self, key: RecordKey, mut cfg: GetValueConfig) -> Result<Bytes> {
        cfg.quorum = Some(cfg.quorum.unwrap_or(self.inner.config.default_quorum));
        let mut stream = self.search_value(key, cfg)?;

        let mut last = None;
        while let Some(value) = stream.next().await {
            last = Some(value);
        }
        last.ok_or(Error::NotFound)
    }

    async fn drive_search(self, key: RecordKey, cfg: GetValueConfig, out_tx: mpsc::Sender<Bytes>) {
        let quorum = cfg.quorum.unwrap_or(0);
        let stop = Arc::new(AtomicBool::new(false));
        let (values_tx, values_rx) = mpsc::channel::<ReceivedValue>(VALUE_PIPELINE_CAPACITY);

        // The local record, when present, enters the pipeline like any other
        // response.
        let mut local_seeded = false;
        match self.inner.record_store.get_local(&key).await {
            Ok(Some(record)) => {
                local_seeded = true;
                let received = ReceivedValue {
                    value: record.value,
                    source: self.inner.local_peer.clone(),
                };
                let _ = values_tx.send(received).await;
            }
            Ok(None) => {}
            Err(error) => debug!(?key, %error, "local record read failed"),
        }

        let selector = tokio::spawn(select_best(
            values_rx,
            self.inner.validator.clone(),
            key.clone(),
            out_tx,
            stop.clone(),
            quorum,
        ));

        let target = key.keyspace_id();
        let query_fn = |peer: PeerId| {
            let dht = self.clone();
            let key = key.clone();
            let values_tx = values_tx.clone();
            async move {
                let (record, closer) = dht.inner.messenger.get_value(&peer, &key).await?;
                if let Some(record) = record {
                    match dht.inner.validator.validate(&key, &record.value) {
                        Ok(()) => {
                            let received = ReceivedValue {
                                value: record.value,
                                source: peer.clone(),
                            };
                            let _ = values_tx.send(received).await;
                        }
                        Err(error) => debug!(%peer, %error, "discarding invalid record"),
                    }
                }
                Ok(dht.absorb_peers(closer))
            }
        };
        let stop_fn = {
            let stop = stop.clone();
            move || stop.load(Ordering::SeqCst)
        };
        let lookup = self.run_lookup(target, query_fn, stop_fn, cfg.deadline).await;
        drop(values_tx);

        let Ok((best, peers_with_best)) = selector.await else {
            error!(?key, "value selector task failed");
            return;
        };
        let Some(best) = best else {
            return;
        };

        // Repair: push the winning record to every visited peer that
        // returned something else, and to the local store if it lost.
        if local_seeded && !peers_with_best.contains(&self.inner.local_peer) {
            let record = Record::new(key.clone(), best.clone()).received_now();
            if let Err(error) = self.inner.record_store.put_local(record).await {
                warn!(?key, %error, "failed to update local record to best value");
            }
        }
        for peer in lookup.queried_peers() {
            if peers_with_best.contains(&peer) {
                continue;
            }
            let messenger = self.inner.messenger.clone();
            let record = Record::new(key.clone(), best.clone());
            tokio::spawn(async move {
                match timeout(CORRECTIVE_PUT_TIMEOUT, messenger.put_value(&peer, record)).await {
                    Ok(Ok(())) => trace!(%peer, "corrective put succeeded"),
                    Ok(Err(error)) => debug!(%peer, %error, "corrective put failed"),
                    Err(_) => debug!(%peer, "corrective put timed out"),
                }
            });
        }
    }
}

/// Fold arriving values into the running best, emitting every improvement.
/// Raises `stop` once more than `quorum` responses have been processed.
async fn select_best(
    mut values_rx: mpsc::Receiver<ReceivedValue>,
    validator: Arc<dyn Validator>,
    key: RecordKey,
    out_tx: mpsc::Sender<Bytes>,
    stop: Arc<AtomicBool>,
    quorum: usize,
) -> (Option<Bytes>, HashSet<PeerId>) {
    let mut best: Option<Bytes> = None;
    let mut peers_with_best: HashSet<PeerId> = HashSet::new();
    let mut processed = 0usize;

    while let Some(received) = values_rx.recv().await {
        processed += 1;
        match &best {
            None => {
                best = Some(received.value.clone());
                peers_with_best.insert(received.source);
                // A closed consumer is fine; the search still repairs peers.
                let _ = out_tx.send(received.value).await;
            }
            Some(current) if *current == received.value => {
                peers_with_best.insert(received.source);
            }
            Some(current) => {
                match validator.select(&key, &[current.clone(), received.value.clone()]) {
                    Ok(1) => {
                        best = Some(received.value.clone());
                        peers_with_best.clear();
                        peers_with_best.insert(received.source);
                        let _ = out_tx.send(received.value).await;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(?key, %error, "validator could not rank competing values")
                    }
                }
            }
        }
        if quorum > 0 && processed > quorum {
            stop.store(true, Ordering::SeqCst);
        }
    }

    (best, peers_with_best)
}
