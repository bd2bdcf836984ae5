//! Recursive scalar fusion.
//!
//! Every tracked quantity is fused independently with the scalar form of a
//! linear recursive Bayesian filter:
//!
//! ```text
//! gain        = uncertainty / (uncertainty + measurement_uncertainty)
//! estimate    = estimate + gain * (measurement − estimate)
//! uncertainty = (1 − gain) * uncertainty
//! ```
//!
//! Uncertainty never reaches zero: it is floored at a small positive value
//! so the filter keeps listening to new measurements.
//!
//! # Example
//!
//! ```rust
//! use rtjoint_perception::estimator::ScalarEstimator;
//!
//! let mut est = ScalarEstimator::new(0.0, 1.0);
//! let value = est.update(1.0, 1.0);
//! assert!((value - 0.5).abs() < 1e-12);
//! assert!((est.uncertainty() - 0.5).abs() < 1e-12);
//! ```

use std::collections::{BTreeMap, HashMap};

use rtjoint_types::SignalKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default uncertainty floor.
pub const DEFAULT_MIN_UNCERTAINTY: f64 = 1e-12;

/// One (estimate, uncertainty) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarEstimator {
    estimate: f64,
    uncertainty: f64,
    min_uncertainty: f64,
}

impl ScalarEstimator {
    /// Start from a prior `estimate` with `uncertainty` (variance).  Invalid
    /// or non-positive uncertainty is raised to the floor.
    pub fn new(estimate: f64, uncertainty: f64) -> Self {
        Self::with_floor(estimate, uncertainty, DEFAULT_MIN_UNCERTAINTY)
    }

    pub fn with_floor(estimate: f64, uncertainty: f64, min_uncertainty: f64) -> Self {
        let min_uncertainty = if min_uncertainty.is_finite() && min_uncertainty > 0.0 {
            min_uncertainty
        } else {
            DEFAULT_MIN_UNCERTAINTY
        };
        let uncertainty = if uncertainty.is_nan() {
            min_uncertainty
        } else {
            uncertainty.max(min_uncertainty)
        };
        Self {
            estimate: if estimate.is_finite() { estimate } else { 0.0 },
            uncertainty,
            min_uncertainty,
        }
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn uncertainty(&self) -> f64 {
        self.uncertainty
    }

    /// Fuse one `measurement` with variance `measurement_uncertainty` and
    /// return the new estimate.
    ///
    /// A non-finite measurement, or a negative or NaN measurement variance,
    /// leaves the state untouched.  Infinite measurement variance is a
    /// no-op fusion (gain 0).
    pub fn update(&mut self, measurement: f64, measurement_uncertainty: f64) -> f64 {
        if !measurement.is_finite()
            || measurement_uncertainty.is_nan()
            || measurement_uncertainty < 0.0
        {
            return self.estimate;
        }
        if measurement_uncertainty.is_infinite() {
            return self.estimate;
        }

        let total = self.uncertainty + measurement_uncertainty;
        if total <= 0.0 || !total.is_finite() {
            return self.estimate;
        }
        let gain = (self.uncertainty / total).clamp(0.0, 1.0);
        self.estimate += gain * (measurement - self.estimate);
        self.uncertainty = ((1.0 - gain) * self.uncertainty).max(self.min_uncertainty);
        self.estimate
    }
}

/// Tuning shared by every estimator in an [`EstimatorBank`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorSettings {
    /// Prior variance of a freshly seeded estimator.
    pub initial_uncertainty: f64,
    /// Floor applied to the per-signal measurement variance (σ²).
    pub min_measurement_variance: f64,
    /// Floor applied to the posterior variance.
    pub min_uncertainty: f64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            initial_uncertainty: 1.0,
            min_measurement_variance: 1e-9,
            min_uncertainty: DEFAULT_MIN_UNCERTAINTY,
        }
    }
}

impl EstimatorSettings {
    /// Measurement variance for a channel whose noise σ is `noise_std`.
    pub fn measurement_variance(&self, noise_std: f64) -> f64 {
        let variance = noise_std * noise_std;
        if variance.is_finite() {
            variance.max(self.min_measurement_variance)
        } else {
            f64::INFINITY
        }
    }
}

/// One [`ScalarEstimator`] per (channel, signal kind).
///
/// An estimator is seeded with the first measurement it sees, so the very
/// first estimate is not dragged toward an arbitrary zero prior.
///
/// Keyed by channel first so lookups borrow the `&str` id; a channel's key
/// is only allocated the first time it is seen.
#[derive(Debug, Clone, Default)]
pub struct EstimatorBank {
    settings: EstimatorSettings,
    estimators: HashMap<String, BTreeMap<SignalKind, ScalarEstimator>>,
}

impl EstimatorBank {
    pub fn new(settings: EstimatorSettings) -> Self {
        Self {
            settings,
            estimators: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    /// Fuse `measurement` for `(channel, kind)` given the channel's noise σ.
    pub fn update(&mut self, channel: &str, kind: SignalKind, measurement: f64, noise_std: f64) -> f64 {
        let variance = self.settings.measurement_variance(noise_std);
        if let Some(est) = self
            .estimators
            .get_mut(channel)
            .and_then(|signals| signals.get_mut(&kind))
        {
            return est.update(measurement, variance);
        }

        let est = ScalarEstimator::with_floor(
            measurement,
            self.settings.initial_uncertainty,
            self.settings.min_uncertainty,
        );
        let value = est.estimate();
        debug!(channel, signal = %kind, seed = value, "estimator seeded");
        match self.estimators.get_mut(channel) {
            Some(signals) => {
                signals.insert(kind, est);
            }
            None => {
                self.estimators
                    .insert(channel.to_string(), BTreeMap::from([(kind, est)]));
            }
        }
        value
    }

    pub fn get(&self, channel: &str, kind: SignalKind) -> Option<&ScalarEstimator> {
        self.estimators.get(channel)?.get(&kind)
    }

    /// Current estimate, if `(channel, kind)` has been seen.
    pub fn estimate(&self, channel: &str, kind: SignalKind) -> Option<f64> {
        self.get(channel, kind).map(ScalarEstimator::estimate)
    }

    /// Number of tracked (channel, signal) pairs.
    pub fn len(&self) -> usize {
        self.estimators.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncertainty_is_non_increasing_and_positive() {
        let mut est = ScalarEstimator::new(0.0, 1.0);
        let mut previous = est.uncertainty();
        let measurements = [0.3, -0.2, 0.9, 0.1, 0.1, 5.0, -3.0];
        let variances = [1e-6, 0.5, 2.0, 1e-3, 10.0, 0.25, 1e-9];
        for round in 0..200 {
            let m = measurements[round % measurements.len()];
            let v = variances[round % variances.len()];
            est.update(m, v);
            assert!(est.uncertainty() <= previous);
            assert!(est.uncertainty() > 0.0);
            previous = est.uncertainty();
        }
    }

    #[test]
    fn equal_variance_updates_strictly_shrink_until_floor() {
        let mut est = ScalarEstimator::new(0.0, 1.0);
        let mut previous = est.uncertainty();
        for _ in 0..20 {
            est.update(1.0, 0.01);
            assert!(est.uncertainty() < previous);
            previous = est.uncertainty();
        }
    }

    #[test]
    fn converges_toward_repeated_measurement() {
        let mut est = ScalarEstimator::new(0.0, 1.0);
        for _ in 0..100 {
            est.update(2.0, 0.1);
        }
        assert!((est.estimate() - 2.0).abs() < 1e-2);
    }

    #[test]
    fn infinite_measurement_variance_is_a_noop() {
        let mut est = ScalarEstimator::new(0.7, 0.5);
        assert_eq!(est.update(100.0, f64::INFINITY), 0.7);
        assert_eq!(est.uncertainty(), 0.5);
    }

    #[test]
    fn bad_inputs_leave_state_unchanged() {
        let mut est = ScalarEstimator::new(0.7, 0.5);
        est.update(f64::NAN, 0.1);
        est.update(f64::INFINITY, 0.1);
        est.update(1.0, -0.1);
        est.update(1.0, f64::NAN);
        assert_eq!(est.estimate(), 0.7);
        assert_eq!(est.uncertainty(), 0.5);
    }

    #[test]
    fn zero_prior_and_zero_measurement_variance_do_not_divide_by_zero() {
        let mut est = ScalarEstimator::with_floor(1.0, 0.0, 1e-12);
        let value = est.update(2.0, 0.0);
        assert!(value.is_finite());
        assert!(est.uncertainty() > 0.0);
    }

    #[test]
    fn bank_seeds_with_first_measurement_and_tracks_pairs_separately() {
        let mut bank = EstimatorBank::new(EstimatorSettings::default());
        assert_eq!(bank.update("hip_left", SignalKind::Position, 0.4, 0.001), 0.4);
        assert_eq!(bank.update("hip_left", SignalKind::Velocity, -1.0, 0.0002), -1.0);
        assert_eq!(bank.update("knee_left", SignalKind::Position, 0.2, 0.001), 0.2);
        assert_eq!(bank.len(), 3);

        let next = bank.update("hip_left", SignalKind::Position, 0.5, 0.001);
        assert!(next > 0.4 && next <= 0.5);
        assert_eq!(bank.estimate("knee_left", SignalKind::Position), Some(0.2));
        assert!(bank.estimate("ankle_left", SignalKind::Position).is_none());
    }

    #[test]
    fn bank_lookups_borrow_the_channel_id() {
        let mut bank = EstimatorBank::new(EstimatorSettings::default());
        for kind in SignalKind::ALL {
            bank.update("ankle_right", kind, 1.0, 0.01);
        }
        assert_eq!(bank.len(), SignalKind::ALL.len());

        // Ids built at runtime resolve to the same entries.
        let id = format!("ankle_{}", "right");
        let before = bank.get(&id, SignalKind::Torque).map(ScalarEstimator::uncertainty);
        bank.update(id.as_str(), SignalKind::Torque, 1.2, 0.01);
        let after = bank.get(&id, SignalKind::Torque).map(ScalarEstimator::uncertainty);
        assert!(after < before);
        assert_eq!(bank.len(), SignalKind::ALL.len());
        assert!(!bank.is_empty());
        assert!(EstimatorBank::default().is_empty());
    }

    #[test]
    fn noise_free_signal_variance_is_floored() {
        let settings = EstimatorSettings::default();
        assert_eq!(settings.measurement_variance(0.0), 1e-9);
        assert!((settings.measurement_variance(0.1) - 0.01).abs() < 1e-15);
    }
}
