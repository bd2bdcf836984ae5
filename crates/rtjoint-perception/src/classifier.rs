//! Rule-based anomaly classification.
//!
//! [`PerceptionUnit::classify`] is a pure function of one cycle's readings
//! for one channel.  Each rule only runs when the signals it needs are
//! present, so a partial [`ReadingSet`] yields a partial
//! [`AnomalyReport`]: missing kinds are absent from the report rather than
//! reported as inactive.
//!
//! Rules, with fractions taken relative to the channel's static limits:
//!
//! - `position_limit`: position outside the central `position_fraction` of
//!   the joint's travel, measured from the middle of the range so that
//!   ranges not centred on zero are treated the same on both sides.
//! - `high_velocity`: absolute velocity above `velocity_fraction · velocity_limit`.
//! - `overheat`: temperature above `overheat_temperature`.
//! - `high_torque`: absolute torque above `torque_fraction · torque_limit`.
//! - `thermal_risk`: torque above `thermal_risk_torque_fraction · torque_limit`
//!   while temperature is above
//!   `thermal_risk_temperature_fraction · overheat_temperature`.

use rtjoint_hal::channel::ChannelLimits;
use rtjoint_types::{AnomalyFlag, AnomalyKind, AnomalyReport, Reading, SignalKind};
use serde::{Deserialize, Serialize};

/// Configurable rule thresholds.  Fractions are relative to the channel's
/// static limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub position_fraction: f64,
    pub velocity_fraction: f64,
    /// Absolute temperature (°C) above which a joint is overheating.
    pub overheat_temperature: f64,
    pub torque_fraction: f64,
    pub thermal_risk_torque_fraction: f64,
    /// Fraction of `overheat_temperature` at which sustained torque becomes
    /// a thermal risk.
    pub thermal_risk_temperature_fraction: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            position_fraction: 0.8,
            velocity_fraction: 0.8,
            overheat_temperature: 50.0,
            torque_fraction: 0.8,
            thermal_risk_torque_fraction: 0.6,
            thermal_risk_temperature_fraction: 0.8,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), rtjoint_types::ControlError> {
        let fractions = [
            ("position_fraction", self.position_fraction),
            ("velocity_fraction", self.velocity_fraction),
            ("torque_fraction", self.torque_fraction),
            ("thermal_risk_torque_fraction", self.thermal_risk_torque_fraction),
            (
                "thermal_risk_temperature_fraction",
                self.thermal_risk_temperature_fraction,
            ),
        ];
        for (name, value) in fractions {
            if !(value.is_finite() && value > 0.0) {
                return Err(rtjoint_types::ControlError::InvalidConfig(format!(
                    "threshold {name} {value} must be positive"
                )));
            }
        }
        if !self.overheat_temperature.is_finite() {
            return Err(rtjoint_types::ControlError::InvalidConfig(
                "overheat_temperature must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// At most one value per signal kind for a single channel and cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReadingSet {
    pub position: Option<f64>,
    pub velocity: Option<f64>,
    pub torque: Option<f64>,
    pub temperature: Option<f64>,
}

impl ReadingSet {
    /// Collect readings; a later reading of the same kind wins.
    pub fn from_readings<'a>(readings: impl IntoIterator<Item = &'a Reading>) -> Self {
        let mut set = Self::default();
        for r in readings {
            set.set(r.kind, r.value);
        }
        set
    }

    pub fn set(&mut self, kind: SignalKind, value: f64) {
        let slot = match kind {
            SignalKind::Position => &mut self.position,
            SignalKind::Velocity => &mut self.velocity,
            SignalKind::Torque => &mut self.torque,
            SignalKind::Temperature => &mut self.temperature,
        };
        *slot = Some(value);
    }

    pub fn get(&self, kind: SignalKind) -> Option<f64> {
        match kind {
            SignalKind::Position => self.position,
            SignalKind::Velocity => self.velocity,
            SignalKind::Torque => self.torque,
            SignalKind::Temperature => self.temperature,
        }
    }
}

/// Stateless classifier.  Holds only its thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerceptionUnit {
    thresholds: Thresholds,
}

impl PerceptionUnit {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Evaluate every rule whose inputs are present in `set`.
    pub fn classify(&self, channel: &str, set: &ReadingSet, limits: &ChannelLimits) -> AnomalyReport {
        let t = &self.thresholds;
        let mut report = AnomalyReport::new(channel);

        if let Some(p) = set.position {
            let center = 0.5 * (limits.position_min + limits.position_max);
            let half_span = 0.5 * (limits.position_max - limits.position_min);
            let active = (p - center).abs() > t.position_fraction * half_span;
            report.flags.insert(
                AnomalyKind::PositionLimit,
                flag(active, || format!("Position {p:.3} near limit")),
            );
        }

        if let Some(v) = set.velocity {
            let active = v.abs() > t.velocity_fraction * limits.velocity_limit;
            report.flags.insert(
                AnomalyKind::HighVelocity,
                flag(active, || format!("High velocity {v:.3}")),
            );
        }

        if let Some(temp) = set.temperature {
            let active = temp > t.overheat_temperature;
            report.flags.insert(
                AnomalyKind::Overheat,
                flag(active, || format!("Overheating: {temp:.1}°C")),
            );
        }

        if let Some(torque) = set.torque {
            let active = torque.abs() > t.torque_fraction * limits.torque_limit;
            report.flags.insert(
                AnomalyKind::HighTorque,
                flag(active, || format!("High torque: {torque:.1} Nm")),
            );
        }

        if let (Some(torque), Some(temp)) = (set.torque, set.temperature) {
            let active = torque > t.thermal_risk_torque_fraction * limits.torque_limit
                && temp > t.thermal_risk_temperature_fraction * t.overheat_temperature;
            report.flags.insert(
                AnomalyKind::ThermalRisk,
                flag(active, || "High risk of overheating".to_string()),
            );
        }

        report
    }
}

fn flag(active: bool, advisory: impl FnOnce() -> String) -> AnomalyFlag {
    AnomalyFlag {
        active,
        advisory: active.then(advisory),
    }
}
