// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the routing core.
///
/// Per-peer transport failures are swallowed inside the lookup engine and
/// never reach callers through this type; they only show up in logs.
#[derive(Error, Debug)]
pub enum Error {
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid key")]
    InvalidKey,

    #[error("validator rejected record: {0}")]
    ValidatorRejected(String),

    #[error("a better value is already stored locally")]
    StaleWrite,

    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found")]
    NotFound,

    #[error("not enough peers: found {found}, required {required}")]
    NotEnoughPeers { found: usize, required: usize },

    #[error("eclipse detector unavailable: {reason}")]
    DetectorUnavailable { reason: String },
}
