//! `rtjoint-runtime` – The fixed-rate control loop
//!
//! Wires the hardware layer, perception, safety supervision and the
//! message queues into one deterministic cycle.
//!
//! # Modules
//!
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   Wait–Command–Read–Estimate–Classify–Monitor–Control–Write–Publish cycle.
//!   It is the only code that mutates the channel registry, the reading
//!   buffers, the estimators and the safety state.
//! - [`scheduler`] – [`FixedRateScheduler`][scheduler::FixedRateScheduler]:
//!   absolute-deadline pacing with missed-deadline accounting and jitter
//!   statistics.
//! - [`config`] – [`ControlLoopConfig`][config::ControlLoopConfig]: every
//!   tunable of the loop as plain serde data.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to any OTLP-compatible collector.
//!
//! # Emergency stop
//!
//! Once the [`SafetyMonitor`][rtjoint_kernel::SafetyMonitor] latches
//! `EmergencyStop`, every channel has already received its stop call and
//! every command the loop computes is exactly zero until an operator sends
//! [`ModeCommand::ResetAfterEstop`][rtjoint_types::ModeCommand::ResetAfterEstop].

pub mod config;
pub mod control_loop;
pub mod scheduler;
pub mod telemetry;

pub use config::{ChannelSpec, ControlLoopConfig, ExitPolicy};
pub use control_loop::{ChannelOutput, ControlLoop, CycleReport, RunSummary};
pub use scheduler::{FixedRateScheduler, JitterStats, Tick};
pub use telemetry::{TracerProviderGuard, init_tracing};
