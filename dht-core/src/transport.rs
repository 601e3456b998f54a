// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Transport-agnostic peer and record types, and the capability traits the
//! routing core consumes.
//!
//! The core never talks to a wire itself. Remote calls go through the
//! [`Messenger`] capability, connectivity questions through [`Network`], and
//! population estimates through [`NetworkSizeEstimator`]. Embedders supply
//! implementations backed by whatever transport they run on.

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keyspace::KeyspaceId;

/// Transport-agnostic peer identifier.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8.min(self.0.len())]))
    }
}

/// Transport-agnostic network address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub protocol: String,
    pub address: String,
}

impl PeerAddress {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }
}

/// A peer together with its known addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addresses: Vec<PeerAddress>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addresses: Vec<PeerAddress>) -> Self {
        Self { peer_id, addresses }
    }
}

/// Connectivity of a peer as reported by the host network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    CanConnect,
    NotConnected,
}

/// Opaque record key. The namespace prefix (`/ns/...`) selects the validator
/// responsible for records under it.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(Vec<u8>);

impl RecordKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hash of the key in the XOR keyspace.
    pub fn keyspace_id(&self) -> KeyspaceId {
        KeyspaceId::hash(&self.0)
    }

    /// Namespace component of a `/ns/rest` key, if any.
    pub fn namespace(&self) -> Option<&[u8]> {
        let rest = self.0.strip_prefix(b"/")?;
        let end = rest.iter().position(|b| *b == b'/')?;
        Some(&rest[..end])
    }
}

impl std::fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "RecordKey({s})"),
            Err(_) => write!(f, "RecordKey(0x{})", hex::encode(&self.0)),
        }
    }
}

/// A stored key/value pair. `value` is opaque to the core; only the validator
/// capability can interpret it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub value: Bytes,
    /// When the local node received this record. `None` on records that came
    /// off the wire and have not been stored yet.
    pub time_received: Option<SystemTime>,
}

impl Record {
    pub fn new(key: RecordKey, value: Bytes) -> Self {
        Self {
            key,
            value,
            time_received: None,
        }
    }

    pub fn received_now(mut self) -> Self {
        self.time_received = Some(SystemTime::now());
        self
    }
}

/// A value returned by some peer during a search.
#[derive(Clone, Debug)]
pub struct ReceivedValue {
    pub value: Bytes,
    pub source: PeerId,
}

/// Remote-peer RPC surface. One call per protocol message; every call is a
/// single round trip to `peer`.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Ask `peer` to store `record`.
    async fn put_value(&self, peer: &PeerId, record: Record) -> Result<()>;

    /// Ask `peer` for the record under `key`. Returns the record if the peer
    /// has one, plus peers closer to the key.
    async fn get_value(
        &self,
        peer: &PeerId,
        key: &RecordKey,
    ) -> Result<(Option<Record>, Vec<PeerInfo>)>;

    /// Announce `provider` (ourselves) for `key` to `peer`.
    async fn put_provider(&self, peer: &PeerId, key: &RecordKey, provider: PeerInfo) -> Result<()>;

    /// Ask `peer` for providers of `key`. Returns provider entries plus peers
    /// closer to the key.
    async fn get_providers(
        &self,
        peer: &PeerId,
        key: &RecordKey,
    ) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)>;

    /// Ask `peer` for the peers it knows closest to `target`. The target is
    /// a keyspace position, so lookups can aim at points with no key
    /// preimage, such as random bucket probes.
    async fn get_closest_peers(&self, peer: &PeerId, target: &KeyspaceId)
        -> Result<Vec<PeerInfo>>;
}

/// Connectivity questions answered by the host network.
pub trait Network: Send + Sync {
    fn connectedness(&self, peer: &PeerId) -> Connectedness;
}

/// Produces a scalar estimate of the reachable network size.
#[async_trait]
pub trait NetworkSizeEstimator: Send + Sync {
    /// Current estimate, or an error when not enough data has been gathered.
    fn network_size(&self) -> Result<f64>;

    /// Actively collect data to improve the estimate.
    async fn gather_data(&self) -> Result<()>;
}
