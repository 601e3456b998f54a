// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Record validation and selection.
//!
//! Validation rules are domain specific, so the core only knows the
//! [`Validator`] capability. [`NamespacedValidator`] dispatches on the key's
//! namespace prefix so that `/a/...` and `/b/...` records can carry different
//! rules.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::transport::RecordKey;

/// Validates records and ranks competing values for the same key.
pub trait Validator: Send + Sync {
    /// Whether `value` is an acceptable record under `key`.
    fn validate(&self, key: &RecordKey, value: &[u8]) -> Result<()>;

    /// Index of the best value among `values`. Must be a total preorder;
    /// ties resolve to the lower index.
    fn select(&self, key: &RecordKey, values: &[Bytes]) -> Result<usize>;
}

/// Dispatches to a sub-validator keyed by the record key's namespace.
#[derive(Default)]
pub struct NamespacedValidator {
    validators: HashMap<Vec<u8>, Arc<dyn Validator>>,
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, namespace: impl Into<Vec<u8>>, validator: Arc<dyn Validator>) -> Self {
        self.add(namespace, validator);
        self
    }

    pub fn add(&mut self, namespace: impl Into<Vec<u8>>, validator: Arc<dyn Validator>) {
        let _ = self.validators.insert(namespace.into(), validator);
    }

    fn validator_for(&self, key: &RecordKey) -> Result<&Arc<dyn Validator>> {
        let namespace = key
            .namespace()
            .ok_or_else(|| Error::ValidatorRejected(format!("{key:?} has no namespace")))?;
        self.validators.get(namespace).ok_or_else(|| {
            Error::ValidatorRejected(format!(
                "no validator registered for namespace {}",
                String::from_utf8_lossy(namespace)
            ))
        })
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &RecordKey, value: &[u8]) -> Result<()> {
        self.validator_for(key)?.validate(key, value)
    }

    fn select(&self, key: &RecordKey, values: &[Bytes]) -> Result<usize> {
        self.validator_for(key)?.select(key, values)
    }
}
