// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The XOR keyspace.
//!
//! Every key and every peer id is mapped through SHA-256 into a fixed-width
//! identifier. Distance, ordering and common-prefix-length comparisons all
//! operate on these identifiers, never on raw bytes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::transport::PeerId;

/// Width of the keyspace in bits.
pub const KEY_BITS: usize = 256;

const KEY_BYTES: usize = KEY_BITS / 8;

/// A point in the 256-bit XOR keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyspaceId([u8; KEY_BYTES]);

impl KeyspaceId {
    /// Hash arbitrary key bytes into the keyspace.
    pub fn hash(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut id = [0u8; KEY_BYTES];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// The keyspace id of a peer. Peers and keys share the address space.
    pub fn from_peer(peer: &PeerId) -> Self {
        Self::hash(peer.as_bytes())
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// XOR distance to `other`, interpreted as an unsigned big-endian integer.
    pub fn distance(&self, other: &KeyspaceId) -> Distance {
        let mut bytes = [0u8; KEY_BYTES];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Distance(bytes)
    }

    /// Length of the longest shared binary prefix with `other`, in `[0, 256]`.
    pub fn common_prefix_len(&self, other: &KeyspaceId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// A uniformly random id whose common prefix with `self` is exactly `cpl`
    /// bits. Used to aim lookups into a specific bucket.
    pub fn random_within_bucket<R: Rng>(&self, cpl: usize, rng: &mut R) -> KeyspaceId {
        debug_assert!(cpl < KEY_BITS);
        let mut bytes = [0u8; KEY_BYTES];
        rng.fill(&mut bytes[..]);
        // Copy the first `cpl` bits from self, then force bit `cpl` to differ.
        let full_bytes = cpl / 8;
        bytes[..full_bytes].copy_from_slice(&self.0[..full_bytes]);
        let rem = cpl % 8;
        let idx = full_bytes;
        let keep_mask: u8 = if rem == 0 { 0 } else { 0xffu8 << (8 - rem) };
        let diverge_bit: u8 = 0x80u8 >> rem;
        bytes[idx] = (self.0[idx] & keep_mask)
            | ((self.0[idx] ^ diverge_bit) & diverge_bit)
            | (bytes[idx] & !(keep_mask | diverge_bit));
        KeyspaceId(bytes)
    }
}

impl std::fmt::Debug for KeyspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyspaceId({}..)", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// XOR distance between two keyspace ids. `Ord` gives the total order used to
/// rank peers relative to a target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; KEY_BYTES]);

impl Distance {
    /// Number of leading zero bits, which equals the common prefix length of
    /// the two ids that produced this distance.
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distance({}..)", hex::encode(&self.0[..4]))
    }
}
