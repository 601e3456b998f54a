// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The routing core of an eclipse-hardened Kademlia DHT client.
//!
//! The overlay operations (`put_value`, `get_value`/`search_value`,
//! `provide`, `find_providers`, `find_peer`) sit on a generic iterative
//! XOR-metric lookup engine. Two hardening measures run alongside them: a
//! widened provider placement that replicates provider records across a full
//! CPL neighborhood sized from the network-size estimate, and a statistical
//! eclipse detector that tests returned neighborhoods against the CPL
//! distribution a uniform network would produce.
//!
//! Everything transport- and storage-shaped is an injected capability; see
//! [`transport`], [`store`] and [`validator`].

#[macro_use]
extern crate tracing;

mod config;
mod detector;
mod dht;
mod error;
mod keyspace;
mod lookup;
mod provider;
mod routing;
mod store;
mod transport;
mod validator;
mod value;
mod widening;


pub use self::{
    config::DhtConfig,
    detector::{Detection, EclipseDetector},
    dht::{Dht, DhtBuilder},
    error::{Error, Result},
    keyspace::{Distance, KeyspaceId, KEY_BITS},
    lookup::{run_lookup_with_followup, LookupResult, PeerLookupState},
    provider::ProvideReport,
    routing::{RoutingTable, RoutingTableView},
    store::{
        MemoryPeerAddressStore, MemoryProviderStore, MemoryRecordStore, PeerAddressStore,
        ProviderStore, RecordStore,
    },
    transport::{
        Connectedness, Messenger, Network, NetworkSizeEstimator, PeerAddress, PeerId, PeerInfo,
        Record, RecordKey, ReceivedValue,
    },
    validator::{NamespacedValidator, Validator},
    value::{GetValueConfig, PutValueConfig},
    widening::min_cpl_for,
};
