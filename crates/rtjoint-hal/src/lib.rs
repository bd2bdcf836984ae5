//! `rtjoint-hal` – Hardware Abstraction Layer
//!
//! Everything the control loop knows about the physical joints goes through
//! the [`HardwareChannel`][channel::HardwareChannel] trait, so a simulated
//! joint and a fieldbus-backed one are interchangeable.
//!
//! # Modules
//!
//! - [`clock`] – [`Clock`][clock::Clock]: monotonic time source, with a
//!   [`SystemClock`][clock::SystemClock] for real runs and a
//!   [`VirtualClock`][clock::VirtualClock] for deterministic tests.
//! - [`channel`] – the [`HardwareChannel`][channel::HardwareChannel] trait,
//!   static [`ChannelLimits`][channel::ChannelLimits] and fault records.
//! - [`sim`] – [`SimChannel`][sim::SimChannel]: a noisy, fault-injecting
//!   point-mass joint, and the [`SimRegistry`][sim::SimRegistry] builder.
//! - [`registry`] – [`ChannelRegistry`][registry::ChannelRegistry]: owns every
//!   channel and addresses them by stable identifier.
//! - [`controller`] – [`JointController`][controller::JointController]: the
//!   bounded PD / recovery torque law.

pub mod channel;
pub mod clock;
pub mod controller;
pub mod registry;
pub mod sim;

pub use channel::{ChannelLimits, FaultOp, FaultRecord, HardwareChannel, JointState};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use controller::{ControlInput, ControlLaw, ControlOutput, ControllerGains, JointController};
pub use registry::ChannelRegistry;
pub use sim::{FaultInjection, PlantModel, SimChannel, SimChannelConfig, SimRegistry};
