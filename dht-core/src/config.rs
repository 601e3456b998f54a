// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

/// Configuration for the routing core.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Whether value storage and retrieval is served at all.
    pub enable_values: bool,
    /// Whether provider records are served at all.
    pub enable_providers: bool,
    /// Bucket size `k`: the number of peers a lookup converges on.
    pub bucket_size: usize,
    /// Concurrency factor `alpha`: parallel in-flight queries per lookup.
    pub alpha: usize,
    /// Replicate provider records across the whole CPL neighborhood instead
    /// of only the `k` closest peers.
    pub special_provide_enabled: bool,
    /// Target population `S` of the widened neighborhood.
    pub special_provide_number: usize,
    /// Sample size the eclipse detector works on.
    pub eclipse_detection_k: usize,
    /// Quorum applied to `get_value` when the caller does not pass one.
    pub default_quorum: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enable_values: true,
            enable_providers: true,
            bucket_size: 20,
            alpha: 3,
            special_provide_enabled: false,
            special_provide_number: 30,
            eclipse_detection_k: 20,
            default_quorum: 16,
        }
    }
}
