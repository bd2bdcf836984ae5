//! `rtjoint-perception` – turning raw readings into something the safety
//! layer and the controller can act on.
//!
//! # Modules
//!
//! - [`buffer`] – [`SignalBuffer`][buffer::SignalBuffer]: fixed-capacity,
//!   timestamped history of readings with oldest-first eviction.
//! - [`estimator`] – [`ScalarEstimator`][estimator::ScalarEstimator]: the
//!   variance-weighted recursive fusion filter, and
//!   [`EstimatorBank`][estimator::EstimatorBank] holding one per
//!   (channel, signal) pair.
//! - [`classifier`] – [`PerceptionUnit`][classifier::PerceptionUnit]:
//!   stateless threshold rules producing an
//!   [`AnomalyReport`][rtjoint_types::AnomalyReport] per channel.

pub mod buffer;
pub mod classifier;
pub mod estimator;

pub use buffer::{DEFAULT_CAPACITY, SignalBuffer};
pub use classifier::{PerceptionUnit, ReadingSet, Thresholds};
pub use estimator::{EstimatorBank, EstimatorSettings, ScalarEstimator};
