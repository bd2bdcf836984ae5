//! Bounded joint torque controller.
//!
//! The controller is deliberately stateless: it maps the current estimated
//! joint state, a target angle, and the safety state to a torque command.
//! Three laws are selected in priority order:
//!
//! 1. **Halted** – the safety monitor is in emergency stop; the command is
//!    exactly zero and no law is evaluated.
//! 2. **Recovery** – the joint has an active position anomaly; a stiffer
//!    proportional law pulls it back toward the target:
//!    `clamp(kp_recover · (target − position), ±recover_limit)`.
//! 3. **Proportional–derivative** – normal tracking:
//!    `clamp(kp · (target − position) − kd · velocity, ±output_limit)`.
//!
//! # Example
//!
//! ```rust
//! use rtjoint_hal::controller::{ControlInput, ControlLaw, ControllerGains, JointController};
//! use rtjoint_types::SafetyState;
//!
//! let controller = JointController::new(ControllerGains::default());
//! let out = controller.compute(&ControlInput {
//!     target: 0.0,
//!     position: 0.5,
//!     velocity: 0.0,
//!     position_anomaly: false,
//!     safety_state: SafetyState::Normal,
//! });
//! assert_eq!(out.law, ControlLaw::ProportionalDerivative);
//! assert!(out.command < 0.0); // pushes the joint back toward zero
//! ```

use rtjoint_types::{ControlError, SafetyState};
use serde::{Deserialize, Serialize};

/// Per-joint controller tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerGains {
    /// Proportional gain of the tracking law.
    pub kp: f64,
    /// Derivative (velocity damping) gain of the tracking law.
    pub kd: f64,
    /// Proportional gain of the recovery law.
    pub kp_recover: f64,
    /// Symmetric clamp of the tracking law (N·m).
    pub output_limit: f64,
    /// Symmetric clamp of the recovery law (N·m).
    pub recover_limit: f64,
}

impl Default for ControllerGains {
    fn default() -> Self {
        Self {
            kp: 5.0,
            kd: 0.5,
            kp_recover: 10.0,
            output_limit: 10.0,
            recover_limit: 20.0,
        }
    }
}

impl ControllerGains {
    pub fn validate(&self) -> Result<(), ControlError> {
        for (name, gain) in [("kp", self.kp), ("kd", self.kd), ("kp_recover", self.kp_recover)] {
            if !gain.is_finite() {
                return Err(ControlError::InvalidConfig(format!("{name} must be finite")));
            }
        }
        for (name, bound) in [
            ("output_limit", self.output_limit),
            ("recover_limit", self.recover_limit),
        ] {
            if !(bound.is_finite() && bound > 0.0) {
                return Err(ControlError::InvalidConfig(format!(
                    "{name} {bound} must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Inputs for one controller evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlInput {
    pub target: f64,
    /// Estimated joint position.
    pub position: f64,
    /// Estimated joint velocity.
    pub velocity: f64,
    /// Whether this joint's position anomaly fired this cycle.
    pub position_anomaly: bool,
    pub safety_state: SafetyState,
}

/// Which law produced a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLaw {
    Halted,
    Recovery,
    ProportionalDerivative,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlOutput {
    pub command: f64,
    pub law: ControlLaw,
}

/// Stateless PD / recovery torque law.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointController {
    gains: ControllerGains,
}

impl JointController {
    pub fn new(gains: ControllerGains) -> Self {
        Self { gains }
    }

    pub fn gains(&self) -> &ControllerGains {
        &self.gains
    }

    /// Compute the torque command for `input`.
    ///
    /// The result always lies within `±output_limit` (tracking) or
    /// `±recover_limit` (recovery), and is `0.0` for non-finite inputs.
    pub fn compute(&self, input: &ControlInput) -> ControlOutput {
        if input.safety_state == SafetyState::EmergencyStop {
            return ControlOutput {
                command: 0.0,
                law: ControlLaw::Halted,
            };
        }

        let g = &self.gains;
        let error = input.target - input.position;
        let (raw, limit, law) = if input.position_anomaly {
            (g.kp_recover * error, g.recover_limit, ControlLaw::Recovery)
        } else {
            (
                g.kp * error - g.kd * input.velocity,
                g.output_limit,
                ControlLaw::ProportionalDerivative,
            )
        };

        let limit = limit.abs();
        let command = if raw.is_finite() {
            raw.clamp(-limit, limit)
        } else if raw.is_nan() {
            0.0
        } else {
            limit.copysign(raw)
        };
        ControlOutput { command, law }
    }
}
