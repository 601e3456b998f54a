// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Statistical eclipse detection.
//!
//! In a network of uniformly placed peers, the common-prefix lengths of the
//! peers closest to any target follow a distribution fixed by the network
//! size. An attacker that crowds a target's neighborhood with generated ids
//! skews that distribution toward high CPLs. The detector compares the
//! observed CPL histogram of a returned peer set against the model
//! distribution with a KL-divergence test.
//!
//! Model: the number of peers sharing at least `i` prefix bits with the
//! target is `X_i ~ Poisson(n / 2^i)`. Among the `k` closest peers, the
//! expected count with CPL at least `i` is `E_i = E[min(k, X_i)]`, so bucket
//! `i` carries probability `(E_i - E_{i+1}) / k`, with everything at or above
//! the cut-off bucket `l` folded together. The threshold is an empirical
//! linear-in-log fit, decreasing in the network size.

use crate::error::{Error, Result};
use crate::keyspace::{KeyspaceId, KEY_BITS};
use crate::transport::PeerId;

/// Floor for the decision threshold.
const MIN_THRESHOLD: f64 = 0.10;
/// Empirical fit of the decision threshold against `ln n`.
const THRESHOLD_INTERCEPT: f64 = 0.94;
const THRESHOLD_SLOPE: f64 = 0.05;
/// Model probabilities are clamped here before entering the log ratio.
const MODEL_EPSILON: f64 = 1e-9;

/// Result of one detection, kept for diagnostic logging.
#[derive(Clone, Debug)]
pub struct Detection {
    /// Whether the neighborhood looks eclipsed.
    pub eclipsed: bool,
    /// Measured KL divergence between observed and model CPL distributions.
    pub kl: f64,
    /// Threshold the divergence was compared against.
    pub threshold: f64,
    /// Observed CPL histogram, bucket `l` holding every CPL at or above it.
    pub counts: Vec<usize>,
}

/// CPL-distribution test against a uniform network of an estimated size.
#[derive(Clone, Debug)]
pub struct EclipseDetector {
    network_size: f64,
    sample_size: usize,
    max_cpl: usize,
    expected: Vec<f64>,
    threshold: f64,
}

impl EclipseDetector {
    /// Build a detector for an estimated network of `network_size` peers,
    /// testing samples of `sample_size` closest peers.
    pub fn new(network_size: f64, sample_size: usize) -> Result<Self> {
        if !network_size.is_finite() || network_size < 1.0 {
            return Err(Error::DetectorUnavailable {
                reason: format!("implausible network size estimate {network_size}"),
            });
        }
        if sample_size == 0 {
            return Err(Error::DetectorUnavailable {
                reason: "sample size must be positive".into(),
            });
        }
        let max_cpl = max_cpl_for(network_size);
        let expected = expected_distribution(network_size, sample_size, max_cpl);
        let threshold =
            (THRESHOLD_INTERCEPT - THRESHOLD_SLOPE * network_size.ln()).max(MIN_THRESHOLD);
        Ok(Self {
            network_size,
            sample_size,
            max_cpl,
            expected,
            threshold,
        })
    }

    pub fn network_size(&self) -> f64 {
        self.network_size
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decide whether `peers` look like an eclipsed neighborhood of
    /// `target`. `peers` must hold at least the sample size; callers pass
    /// them ascending by distance and only the first `sample_size` are used.
    pub fn detect(&self, target: &KeyspaceId, peers: &[PeerId]) -> Result<Detection> {
        if peers.len() < self.sample_size {
            return Err(Error::NotEnoughPeers {
                found: peers.len(),
                required: self.sample_size,
            });
        }

        let mut counts = vec![0usize; self.max_cpl + 1];
        for peer in &peers[..self.sample_size] {
            let cpl = target.common_prefix_len(&KeyspaceId::from_peer(peer));
            counts[cpl.min(self.max_cpl)] += 1;
        }

        let observed: Vec<f64> = counts
            .iter()
            .map(|c| *c as f64 / self.sample_size as f64)
            .collect();
        let kl = kl_divergence(&observed, &self.expected);
        let eclipsed = kl > self.threshold;
        debug!(
            kl,
            threshold = self.threshold,
            eclipsed,
            network_size = self.network_size,
            "eclipse detection"
        );
        Ok(Detection {
            eclipsed,
            kl,
            threshold: self.threshold,
            counts,
        })
    }

    /// The model CPL distribution, indexable by bucket.
    pub fn expected_distribution(&self) -> &[f64] {
        &self.expected
    }
}

/// Cut-off bucket: past it the expected occupancy `n / 2^l` drops below an
/// eighth of a peer.
fn max_cpl_for(network_size: f64) -> usize {
    let l = network_size.log2().ceil() as usize + 3;
    l.min(KEY_BITS - 1)
}

fn expected_distribution(network_size: f64, sample_size: usize, max_cpl: usize) -> Vec<f64> {
    let k = sample_size as f64;
    let e: Vec<f64> = (0..=max_cpl + 1)
        .map(|i| expected_min_count(network_size / 2f64.powi(i as i32), sample_size))
        .collect();
    (0..=max_cpl)
        .map(|i| {
            if i == max_cpl {
                e[i] / k
            } else {
                (e[i] - e[i + 1]) / k
            }
        })
        .collect()
}

/// `E[min(k, X)]` for `X ~ Poisson(lambda)`.
fn expected_min_count(lambda: f64, k: usize) -> f64 {
    if lambda >= 20.0 * k as f64 + 100.0 {
        // P(X < k) is vanishing; min(k, X) is k almost surely.
        return k as f64;
    }
    // E[min(k, X)] = k - sum_{j < k} (k - j) P(X = j)
    let mut pmf = (-lambda).exp();
    let mut deficit = 0.0;
    for j in 0..k {
        deficit += (k - j) as f64 * pmf;
        pmf *= lambda / (j as f64 + 1.0);
    }
    k as f64 - deficit
}

/// `sum_i p_i ln(p_i / q_i)` with the `0 ln 0 = 0` convention and the model
/// clamped away from zero.
pub(crate) fn kl_divergence(observed: &[f64], model: &[f64]) -> f64 {
    observed
        .iter()
        .zip(model)
        .filter(|(p, _)| **p > 0.0)
        .map(|(p, q)| p * (p / q.max(MODEL_EPSILON)).ln())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn expected_distribution_sums_to_one() {
        for n in [25.0, 960.0, 1000.0, 50_000.0] {
            let detector = EclipseDetector::new(n, 20).unwrap();
            let total: f64 = detector.expected_distribution().iter().sum();
            assert!((total - 1.0).abs() < 1e-6, "n = {n}: sum {total}");
        }
    }

    #[test]
    fn expected_min_count_limits() {
        // lambda far above k: every one of the k slots is occupied.
        assert!((expected_min_count(1000.0, 20) - 20.0).abs() < 1e-9);
        // lambda far below k: the min rarely binds, expectation is lambda.
        assert!((expected_min_count(0.1, 20) - 0.1).abs() < 1e-6);
        assert_eq!(expected_min_count(0.0, 20), 0.0);
    }

    #[test]
    fn kl_zero_iff_equal() {
        let p = vec![0.5, 0.3, 0.2];
        assert!(kl_divergence(&p, &p).abs() < 1e-12);

        let q = vec![0.2, 0.3, 0.5];
        assert!(kl_divergence(&p, &q) > 0.0);
    }

    #[test]
    fn threshold_decreases_with_network_size() {
        let small = EclipseDetector::new(100.0, 20).unwrap();
        let large = EclipseDetector::new(1_000_000.0, 20).unwrap();
        assert!(small.threshold() > large.threshold());
        assert!(large.threshold() >= MIN_THRESHOLD);
    }

    #[test]
    fn rejects_undersized_samples() {
        let detector = EclipseDetector::new(1000.0, 20).unwrap();
        let target = KeyspaceId::hash(b"t");
        let peers: Vec<PeerId> = (0..10u8).map(|n| PeerId::new(vec![n])).collect();
        assert!(matches!(
            detector.detect(&target, &peers),
            Err(Error::NotEnoughPeers {
                found: 10,
                required: 20
            })
        ));
    }

    /// Brute-force a peer id whose keyspace CPL with `target` is exactly
    /// `cpl`.
    fn peer_with_cpl(target: &KeyspaceId, cpl: usize, rng: &mut StdRng) -> PeerId {
        use rand::Rng;
        loop {
            let candidate = PeerId::new(rng.gen::<[u8; 16]>().to_vec());
            if target.common_prefix_len(&KeyspaceId::from_peer(&candidate)) == cpl {
                return candidate;
            }
        }
    }

    #[test]
    fn flags_crowded_neighborhood() {
        // Twenty peers all sharing 8+ prefix bits with the target, in a
        // network of a thousand where fewer than four such peers are
        // expected. This is the attack shape.
        let mut rng = StdRng::seed_from_u64(42);
        let detector = EclipseDetector::new(1000.0, 20).unwrap();
        let target = KeyspaceId::hash(b"victim");
        let peers: Vec<PeerId> = (0..20).map(|_| peer_with_cpl(&target, 8, &mut rng)).collect();

        let detection = detector.detect(&target, &peers).unwrap();
        assert!(detection.eclipsed, "kl {} <= {}", detection.kl, detection.threshold);
    }

    #[test]
    fn accepts_model_shaped_neighborhood() {
        // Build a sample whose histogram tracks the model distribution; the
        // divergence must stay under the threshold.
        let mut rng = StdRng::seed_from_u64(43);
        let detector = EclipseDetector::new(1000.0, 20).unwrap();
        let target = KeyspaceId::hash(b"victim");

        let mut peers = Vec::new();
        let mut remaining = 20usize;
        let expected = detector.expected_distribution().to_vec();
        for (cpl, share) in expected.iter().enumerate().rev() {
            let count = ((share * 20.0).round() as usize).min(remaining);
            for _ in 0..count {
                peers.push(peer_with_cpl(&target, cpl, &mut rng));
            }
            remaining -= count;
        }
        // Any rounding slack lands in the most likely bucket.
        let likeliest = expected
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(cpl, _)| cpl)
            .unwrap();
        for _ in 0..remaining {
            peers.push(peer_with_cpl(&target, likeliest, &mut rng));
        }

        let detection = detector.detect(&target, &peers).unwrap();
        assert!(!detection.eclipsed, "kl {} > {}", detection.kl, detection.threshold);
    }

    #[test]
    fn detection_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(44);
        let detector = EclipseDetector::new(5000.0, 20).unwrap();
        let target = KeyspaceId::hash(b"t");
        let peers: Vec<PeerId> = (0..20).map(|_| peer_with_cpl(&target, 6, &mut rng)).collect();

        let a = detector.detect(&target, &peers).unwrap();
        let b = detector.detect(&target, &peers).unwrap();
        assert_eq!(a.eclipsed, b.eclipsed);
        assert_eq!(a.kl, b.kl);
        assert_eq!(a.counts, b.counts);
    }
}
