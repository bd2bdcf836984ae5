//! [`ControlLoopConfig`] – everything fixed at construction time.
//!
//! The configuration is plain serde data so it can come from a TOML file,
//! an embedding application, or a test.  It is never reloaded mid-run.

use std::collections::HashSet;

use rtjoint_hal::channel::{ChannelLimits, JointState};
use rtjoint_hal::controller::ControllerGains;
use rtjoint_hal::sim::{FaultInjection, PlantModel, SimChannelConfig};
use rtjoint_kernel::deadline_guard::DeadlinePolicy;
use rtjoint_kernel::safety_monitor::SeverityPolicy;
use rtjoint_perception::buffer::DEFAULT_CAPACITY;
use rtjoint_perception::classifier::Thresholds;
use rtjoint_perception::estimator::EstimatorSettings;
use rtjoint_types::ControlError;
use serde::{Deserialize, Serialize};

/// What [`ControlLoop::run`][crate::control_loop::ControlLoop::run] does
/// once the emergency stop is latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Return after one full cycle spent in `EmergencyStop`.
    #[default]
    StopAfterEmergencyCycle,
    /// Keep cycling with zero commands until the stop signal is raised.
    KeepReporting,
}

/// One joint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    /// Initial target angle (radians).
    #[serde(default)]
    pub target: f64,
    #[serde(default)]
    pub limits: ChannelLimits,
    #[serde(default)]
    pub faults: FaultInjection,
    #[serde(default)]
    pub plant: PlantModel,
    #[serde(default)]
    pub initial: JointState,
    /// Overrides the loop-wide gains for this joint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gains: Option<ControllerGains>,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: 0.0,
            limits: ChannelLimits::default(),
            faults: FaultInjection::default(),
            plant: PlantModel::default(),
            initial: JointState::default(),
            gains: None,
        }
    }

    /// Joint at rest at `position`.
    pub fn at(id: impl Into<String>, position: f64) -> Self {
        Self {
            initial: JointState {
                position,
                ..JointState::default()
            },
            ..Self::new(id)
        }
    }

    pub fn sim_config(&self) -> SimChannelConfig {
        SimChannelConfig::new(self.id.clone())
            .with_limits(self.limits)
            .with_faults(self.faults)
            .with_plant(self.plant)
            .with_initial(self.initial)
    }
}

/// Full control-loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopConfig {
    pub frequency_hz: f64,
    /// Readings kept per (channel, signal).
    pub buffer_capacity: usize,
    /// Master seed for simulated noise and faults.
    pub seed: u64,
    /// Run each channel's I/O on its own scoped thread.
    pub parallel_io: bool,
    pub exit_policy: ExitPolicy,
    /// Pending inbound commands before senders are refused.
    pub command_capacity: usize,
    /// Events buffered per outbound topic.
    pub event_capacity: usize,
    pub deadline_policy: DeadlinePolicy,
    pub thresholds: Thresholds,
    pub severity_policy: SeverityPolicy,
    pub estimator: EstimatorSettings,
    /// Default gains for joints without an override.
    pub gains: ControllerGains,
    pub channels: Vec<ChannelSpec>,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        let channels = [
            ("hip_left", 0.1),
            ("knee_left", 0.2),
            ("ankle_left", -0.1),
            ("hip_right", -0.1),
            ("knee_right", -0.2),
            ("ankle_right", 0.1),
        ]
        .into_iter()
        .map(|(id, position)| ChannelSpec::at(id, position))
        .collect();

        Self {
            frequency_hz: 500.0,
            buffer_capacity: DEFAULT_CAPACITY,
            seed: 42,
            parallel_io: false,
            exit_policy: ExitPolicy::default(),
            command_capacity: rtjoint_middleware::command::DEFAULT_CAPACITY,
            event_capacity: rtjoint_middleware::bus::DEFAULT_CAPACITY,
            deadline_policy: DeadlinePolicy::default(),
            thresholds: Thresholds::default(),
            severity_policy: SeverityPolicy::default(),
            estimator: EstimatorSettings::default(),
            gains: ControllerGains::default(),
            channels,
        }
    }
}

impl ControlLoopConfig {
    /// Same loop settings, different joints.
    pub fn with_channels(mut self, channels: Vec<ChannelSpec>) -> Self {
        self.channels = channels;
        self
    }

    /// Gains in effect for `spec`.
    pub fn gains_for(&self, spec: &ChannelSpec) -> ControllerGains {
        spec.gains.unwrap_or(self.gains)
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if !(self.frequency_hz.is_finite() && self.frequency_hz > 0.0) {
            return Err(ControlError::InvalidConfig(format!(
                "frequency_hz {} must be positive",
                self.frequency_hz
            )));
        }
        if self.channels.is_empty() {
            return Err(ControlError::InvalidConfig("no channels configured".into()));
        }
        self.deadline_policy.validate()?;
        self.thresholds.validate()?;
        self.gains.validate()?;
        if !(self.estimator.initial_uncertainty.is_finite() && self.estimator.initial_uncertainty > 0.0) {
            return Err(ControlError::InvalidConfig(
                "estimator.initial_uncertainty must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &self.channels {
            if spec.id.trim().is_empty() {
                return Err(ControlError::InvalidConfig("channel id must not be empty".into()));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(ControlError::InvalidConfig(format!(
                    "duplicate channel id {}",
                    spec.id
                )));
            }
            let context = |e: ControlError| match e {
                ControlError::InvalidConfig(msg) => {
                    ControlError::InvalidConfig(format!("channel {}: {msg}", spec.id))
                }
                other => other,
            };
            spec.limits.validate().map_err(context)?;
            spec.faults.validate().map_err(context)?;
            spec.plant.validate().map_err(context)?;
            if let Some(gains) = &spec.gains {
                gains.validate().map_err(context)?;
            }
            if !spec.target.is_finite() {
                return Err(context(ControlError::InvalidConfig("target must be finite".into())));
            }
        }
        Ok(())
    }
}
