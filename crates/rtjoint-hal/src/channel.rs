//! Generic `HardwareChannel` trait for one actuator + sensor unit (a joint).
//!
//! Drivers implement this trait and register themselves with a
//! [`ChannelRegistry`][crate::registry::ChannelRegistry].  The rest of the
//! stack only ever talks to the trait, so a fieldbus driver can replace the
//! simulated one without touching estimation, safety, or control code.

use std::time::Duration;

use rtjoint_types::{ControlError, Reading, SignalKind};
use serde::{Deserialize, Serialize};

/// Static per-channel limits.  Every value a channel reports is clamped into
/// these ranges, and every torque command is clamped to `±torque_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLimits {
    /// Lower joint stop (radians).
    pub position_min: f64,
    /// Upper joint stop (radians).
    pub position_max: f64,
    /// Symmetric velocity bound (rad/s).
    pub velocity_limit: f64,
    /// Symmetric torque bound (N·m).
    pub torque_limit: f64,
    /// Sensor range of the temperature probe (°C).
    pub temperature_min: f64,
    pub temperature_max: f64,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            position_min: -std::f64::consts::PI,
            position_max: std::f64::consts::PI,
            velocity_limit: 5.0,
            torque_limit: 50.0,
            temperature_min: -40.0,
            temperature_max: 150.0,
        }
    }
}

impl ChannelLimits {
    /// The inclusive `(min, max)` range for `kind`.
    pub fn bounds(&self, kind: SignalKind) -> (f64, f64) {
        match kind {
            SignalKind::Position => (self.position_min, self.position_max),
            SignalKind::Velocity => (-self.velocity_limit, self.velocity_limit),
            SignalKind::Torque => (-self.torque_limit, self.torque_limit),
            SignalKind::Temperature => (self.temperature_min, self.temperature_max),
        }
    }

    /// Clamp `value` into the range for `kind`.  NaN collapses to the value
    /// closest to zero inside the range.
    pub fn clamp(&self, kind: SignalKind, value: f64) -> f64 {
        let (lo, hi) = self.bounds(kind);
        let value = if value.is_nan() { 0.0 } else { value };
        value.clamp(lo, hi)
    }

    /// Reject inverted or non-finite ranges.
    pub fn validate(&self) -> Result<(), ControlError> {
        for kind in SignalKind::ALL {
            let (lo, hi) = self.bounds(kind);
            if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                return Err(ControlError::InvalidConfig(format!(
                    "{kind} range [{lo}, {hi}] is empty or not finite"
                )));
            }
        }
        Ok(())
    }
}

/// Continuous physical state of a joint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointState {
    pub position: f64,
    pub velocity: f64,
    pub torque: f64,
    pub temperature: f64,
}

impl Default for JointState {
    fn default() -> Self {
        Self {
            position: 0.0,
            velocity: 0.0,
            torque: 0.0,
            temperature: 25.0,
        }
    }
}

impl JointState {
    pub fn get(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::Position => self.position,
            SignalKind::Velocity => self.velocity,
            SignalKind::Torque => self.torque,
            SignalKind::Temperature => self.temperature,
        }
    }
}

/// The operation that hit a transient fault.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaultOp {
    Read(SignalKind),
    Write { command: f64 },
}

/// One masked transient fault, kept for later inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultRecord {
    pub at: Duration,
    pub op: FaultOp,
}

/// One actuator + sensor unit.
///
/// Implementations own their state exclusively; it changes only through
/// [`read`][Self::read], [`write`][Self::write] and
/// [`emergency_stop`][Self::emergency_stop].  No call may block for longer
/// than the channel's bounded I/O latency.
pub trait HardwareChannel: Send + Sync {
    /// Stable identifier, e.g. `"hip_left"`.
    fn id(&self) -> &str;

    /// Static limits for this channel.
    fn limits(&self) -> &ChannelLimits;

    /// Sample `kind`.
    ///
    /// The returned value always lies inside [`ChannelLimits::bounds`].
    /// Transient faults are masked with the last known clamped true value and
    /// recorded; they never surface as errors.
    fn read(&mut self, kind: SignalKind) -> Reading;

    /// Apply a torque command (clamped to the torque bound).
    ///
    /// Returns `false` when the hardware reports that the command was not
    /// applied.  Failure leaves the physical state untouched.
    fn write(&mut self, command: f64) -> bool;

    /// Force zero torque and zero velocity, bypassing the normal write path.
    /// Must never fail.
    fn emergency_stop(&mut self);

    /// Standard deviation of the measurement noise for `kind`, used to weight
    /// the channel's readings during fusion.
    fn measurement_noise(&self, kind: SignalKind) -> f64;

    /// Total number of transient faults masked since construction.
    fn fault_count(&self) -> u64;

    /// The most recent fault records, oldest first.
    fn recent_faults(&self) -> Vec<FaultRecord>;
}
