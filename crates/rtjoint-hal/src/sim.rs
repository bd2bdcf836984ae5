//! In-process simulated joints for tests, CI, and offline runs.
//!
//! [`SimChannel`] models a single revolute joint as a first-order point mass
//! with noisy sensors, fixed per-signal latency and randomly injected
//! transient faults.  Randomness comes from a seeded [`StdRng`] owned by the
//! channel, so a run is reproducible from its seed.
//!
//! [`SimRegistry`] builds a [`ChannelRegistry`] pre-populated with simulated
//! channels, deriving one seed per channel from a single master seed.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rtjoint_hal::clock::VirtualClock;
//! use rtjoint_hal::sim::{SimChannelConfig, SimRegistry};
//!
//! let clock = Arc::new(VirtualClock::new());
//! let mut registry = SimRegistry::builder(clock)
//!     .seed(7)
//!     .with_channel(SimChannelConfig::new("hip_left"))
//!     .with_channel(SimChannelConfig::new("knee_left"))
//!     .build();
//!
//! assert_eq!(registry.len(), 2);
//! assert_eq!(registry.emergency_stop_all(), 2);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rtjoint_types::{ControlError, Reading, SignalKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{ChannelLimits, FaultOp, FaultRecord, HardwareChannel, JointState};
use crate::clock::Clock;
use crate::registry::ChannelRegistry;

/// Number of fault records a channel keeps for inspection.
const FAULT_LOG_CAPACITY: usize = 256;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Fault-injection parameters for a simulated channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjection {
    /// Latency of a position/velocity/torque read and of a write.
    /// Temperature reads take a tenth of it.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Position noise σ.  Velocity uses σ/5, torque 10·σ, temperature none.
    pub noise_std: f64,
    /// Probability that any single read or write hits a transient fault.
    pub error_rate: f64,
}

impl Default for FaultInjection {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            noise_std: 0.001,
            error_rate: 0.001,
        }
    }
}

impl FaultInjection {
    /// No latency, no noise, no faults.
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            noise_std: 0.0,
            error_rate: 0.0,
        }
    }

    /// Noise σ applied to readings of `kind`.
    pub fn noise_for(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::Position => self.noise_std,
            SignalKind::Velocity => self.noise_std / 5.0,
            SignalKind::Torque => self.noise_std * 10.0,
            SignalKind::Temperature => 0.0,
        }
    }

    /// Simulated bus latency of a read of `kind`.
    pub fn latency_for(&self, kind: SignalKind) -> Duration {
        match kind {
            SignalKind::Temperature => self.base_delay / 10,
            _ => self.base_delay,
        }
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(ControlError::InvalidConfig(format!(
                "error_rate {} outside [0, 1]",
                self.error_rate
            )));
        }
        if !self.noise_std.is_finite() || self.noise_std < 0.0 {
            return Err(ControlError::InvalidConfig(format!(
                "noise_std {} must be finite and non-negative",
                self.noise_std
            )));
        }
        Ok(())
    }
}

/// `Duration` as fractional milliseconds, which is how latencies are
/// written in config files.
mod millis {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        let nanos = (ms * 1_000_000.0).round();
        if !(nanos.is_finite() && nanos >= 0.0 && nanos <= u64::MAX as f64) {
            return Err(D::Error::custom(format!("invalid delay {ms} ms")));
        }
        Ok(Duration::from_nanos(nanos as u64))
    }
}

/// Point-mass dynamics used by [`SimChannel::write`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantModel {
    /// Effective inertia (kg·m², treated as a point mass).
    pub assumed_mass: f64,
    /// Integration step per write (seconds).
    pub dt: f64,
    /// Temperature rise per N·m·s of applied torque (°C).
    pub heating_coefficient: f64,
}

impl Default for PlantModel {
    fn default() -> Self {
        Self {
            assumed_mass: 1.0,
            dt: 0.001,
            heating_coefficient: 1.0,
        }
    }
}

impl PlantModel {
    pub fn validate(&self) -> Result<(), ControlError> {
        if !(self.assumed_mass.is_finite() && self.assumed_mass > 0.0) {
            return Err(ControlError::InvalidConfig(format!(
                "assumed_mass {} must be positive",
                self.assumed_mass
            )));
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(ControlError::InvalidConfig(format!(
                "plant dt {} must be positive",
                self.dt
            )));
        }
        if !self.heating_coefficient.is_finite() || self.heating_coefficient < 0.0 {
            return Err(ControlError::InvalidConfig(format!(
                "heating_coefficient {} must be non-negative",
                self.heating_coefficient
            )));
        }
        Ok(())
    }
}

/// Everything needed to build one [`SimChannel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimChannelConfig {
    pub id: String,
    #[serde(default)]
    pub limits: ChannelLimits,
    #[serde(default)]
    pub faults: FaultInjection,
    #[serde(default)]
    pub plant: PlantModel,
    #[serde(default)]
    pub initial: JointState,
}

impl SimChannelConfig {
    /// Default limits, faults and plant; joint at rest at 25 °C.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            limits: ChannelLimits::default(),
            faults: FaultInjection::default(),
            plant: PlantModel::default(),
            initial: JointState::default(),
        }
    }

    pub fn with_limits(mut self, limits: ChannelLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_faults(mut self, faults: FaultInjection) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_plant(mut self, plant: PlantModel) -> Self {
        self.plant = plant;
        self
    }

    pub fn with_initial(mut self, initial: JointState) -> Self {
        self.initial = initial;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimChannel
// ────────────────────────────────────────────────────────────────────────────

/// A simulated joint with noisy, latent, occasionally faulty I/O.
pub struct SimChannel {
    id: String,
    limits: ChannelLimits,
    faults: FaultInjection,
    plant: PlantModel,
    state: JointState,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    fault_log: VecDeque<FaultRecord>,
    fault_total: u64,
    estop_count: u64,
}

impl SimChannel {
    /// Build a channel from `config`.  The initial state is clamped into the
    /// configured limits.
    pub fn new(config: SimChannelConfig, clock: Arc<dyn Clock>, seed: u64) -> Self {
        let limits = config.limits;
        let initial = config.initial;
        let state = JointState {
            position: limits.clamp(SignalKind::Position, initial.position),
            velocity: limits.clamp(SignalKind::Velocity, initial.velocity),
            torque: limits.clamp(SignalKind::Torque, initial.torque),
            temperature: limits.clamp(SignalKind::Temperature, initial.temperature),
        };
        Self {
            id: config.id,
            limits,
            faults: config.faults,
            plant: config.plant,
            state,
            clock,
            rng: StdRng::seed_from_u64(seed),
            fault_log: VecDeque::with_capacity(FAULT_LOG_CAPACITY),
            fault_total: 0,
            estop_count: 0,
        }
    }

    /// The true (noise-free) physical state.
    pub fn state(&self) -> JointState {
        self.state
    }

    /// How many emergency-stop broadcasts this channel has received.
    pub fn emergency_stop_count(&self) -> u64 {
        self.estop_count
    }

    fn roll_fault(&mut self) -> bool {
        let p = self.faults.error_rate;
        p > 0.0 && self.rng.gen_bool(p.min(1.0))
    }

    fn noise(&mut self, kind: SignalKind) -> f64 {
        let sigma = self.faults.noise_for(kind);
        if sigma <= 0.0 {
            return 0.0;
        }
        Normal::new(0.0, sigma)
            .map(|n| n.sample(&mut self.rng))
            .unwrap_or(0.0)
    }

    fn record_fault(&mut self, op: FaultOp) {
        if self.fault_log.len() == FAULT_LOG_CAPACITY {
            self.fault_log.pop_front();
        }
        self.fault_log.push_back(FaultRecord {
            at: self.clock.now(),
            op,
        });
        self.fault_total += 1;
    }

    /// Integrate one step of the point-mass model under `command`.
    fn integrate(&mut self, command: f64) {
        let acceleration = command / self.plant.assumed_mass;
        let dt = self.plant.dt;
        self.state.velocity = self
            .limits
            .clamp(SignalKind::Velocity, self.state.velocity + acceleration * dt);
        self.state.position = self
            .limits
            .clamp(SignalKind::Position, self.state.position + self.state.velocity * dt);
        self.state.temperature = self.limits.clamp(
            SignalKind::Temperature,
            self.state.temperature + command.abs() * self.plant.heating_coefficient * dt,
        );
        self.state.torque = command;
    }
}

impl HardwareChannel for SimChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn limits(&self) -> &ChannelLimits {
        &self.limits
    }

    fn read(&mut self, kind: SignalKind) -> Reading {
        self.clock.sleep(self.faults.latency_for(kind));

        let truth = self.state.get(kind);
        let value = if self.roll_fault() {
            self.record_fault(FaultOp::Read(kind));
            debug!(channel = %self.id, signal = %kind, "transient read fault masked");
            self.limits.clamp(kind, truth)
        } else {
            let noisy = truth + self.noise(kind);
            self.limits.clamp(kind, noisy)
        };

        Reading {
            timestamp: self.clock.now(),
            channel: self.id.clone(),
            kind,
            value,
        }
    }

    fn write(&mut self, command: f64) -> bool {
        self.clock.sleep(self.faults.base_delay);

        let command = self.limits.clamp(SignalKind::Torque, command);
        if self.roll_fault() {
            self.record_fault(FaultOp::Write { command });
            debug!(channel = %self.id, command, "transient write fault, command dropped");
            return false;
        }
        self.integrate(command);
        true
    }

    fn emergency_stop(&mut self) {
        self.integrate(0.0);
        self.state.velocity = 0.0;
        self.state.torque = 0.0;
        self.estop_count += 1;
        warn!(channel = %self.id, "emergency stop applied");
    }

    fn measurement_noise(&self, kind: SignalKind) -> f64 {
        self.faults.noise_for(kind)
    }

    fn fault_count(&self) -> u64 {
        self.fault_total
    }

    fn recent_faults(&self) -> Vec<FaultRecord> {
        self.fault_log.iter().copied().collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRegistry builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder that constructs a [`ChannelRegistry`] populated with
/// [`SimChannel`]s sharing one clock.
pub struct SimRegistry {
    clock: Arc<dyn Clock>,
    seed: u64,
    channels: Vec<SimChannelConfig>,
}

impl SimRegistry {
    /// Create a builder with no channels and master seed `0`.
    pub fn builder(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            seed: 0,
            channels: Vec::new(),
        }
    }

    /// Master seed from which every channel's RNG seed is derived.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Add a simulated channel.
    pub fn with_channel(mut self, config: SimChannelConfig) -> Self {
        self.channels.push(config);
        self
    }

    /// Consume the builder and return the populated registry.  Channels keep
    /// the order in which they were added.
    pub fn build(self) -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        for (index, config) in self.channels.into_iter().enumerate() {
            let seed = channel_seed(self.seed, index);
            registry.register(Box::new(SimChannel::new(config, Arc::clone(&self.clock), seed)));
        }
        registry
    }
}

/// Spread a master seed across channels so neighbouring joints never share
/// a noise sequence.
pub fn channel_seed(master: u64, index: usize) -> u64 {
    master ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
