//! `rtjoint-types` – Shared value types
//!
//! Readings, anomaly reports, safety issues and states, inbound commands,
//! outbound telemetry and the [`Event`] envelope used on the event bus, plus
//! the crate-wide [`ControlError`].  Everything is plain serde data.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The four physical quantities every joint channel reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Joint angle (radians).
    Position,
    /// Joint angular velocity (rad/s).
    Velocity,
    /// Applied torque (N·m).
    Torque,
    /// Motor winding temperature (°C).
    Temperature,
}

impl SignalKind {
    /// Every signal kind, in the order a channel is sampled each cycle.
    pub const ALL: [SignalKind; 4] = [
        SignalKind::Position,
        SignalKind::Velocity,
        SignalKind::Torque,
        SignalKind::Temperature,
    ];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Position => write!(f, "position"),
            SignalKind::Velocity => write!(f, "velocity"),
            SignalKind::Torque => write!(f, "torque"),
            SignalKind::Temperature => write!(f, "temperature"),
        }
    }
}

/// One timestamped sensor value.  Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Monotonic time since the clock epoch.
    pub timestamp: Duration,
    pub channel: String,
    pub kind: SignalKind,
    pub value: f64,
}

/// Rule-triggered flags produced by the perception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    PositionLimit,
    HighVelocity,
    Overheat,
    HighTorque,
    /// Predictive early warning: sustained torque while already warm.
    ThermalRisk,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 5] = [
        AnomalyKind::PositionLimit,
        AnomalyKind::HighVelocity,
        AnomalyKind::Overheat,
        AnomalyKind::HighTorque,
        AnomalyKind::ThermalRisk,
    ];
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::PositionLimit => write!(f, "position_limit"),
            AnomalyKind::HighVelocity => write!(f, "high_velocity"),
            AnomalyKind::Overheat => write!(f, "overheat"),
            AnomalyKind::HighTorque => write!(f, "high_torque"),
            AnomalyKind::ThermalRisk => write!(f, "thermal_risk"),
        }
    }
}

/// Outcome of evaluating one anomaly rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub active: bool,
    /// Operator-facing advisory text, present only when `active`.
    pub advisory: Option<String>,
}

/// Per-channel anomaly evaluation for a single cycle.
///
/// A kind that is absent from [`AnomalyReport::flags`] was not evaluated
/// (its input signal was missing from the reading set).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub channel: String,
    pub flags: BTreeMap<AnomalyKind, AnomalyFlag>,
}

impl AnomalyReport {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            flags: BTreeMap::new(),
        }
    }

    /// `true` when `kind` was evaluated and fired.
    pub fn is_active(&self, kind: AnomalyKind) -> bool {
        self.flags.get(&kind).is_some_and(|f| f.active)
    }

    /// `true` when `kind` was evaluated at all this cycle.
    pub fn evaluated(&self, kind: AnomalyKind) -> bool {
        self.flags.contains_key(&kind)
    }

    /// Iterate over the kinds that fired, with their advisory text.
    pub fn active(&self) -> impl Iterator<Item = (AnomalyKind, &str)> + '_ {
        self.flags.iter().filter(|(_, f)| f.active).map(|(k, f)| {
            (*k, f.advisory.as_deref().unwrap_or_default())
        })
    }
}

/// Issue severity.  `High` always forces an emergency stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

/// What a [`SafetyIssue`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Anomaly(AnomalyKind),
    /// The channel reported that an actuator write was not applied.
    CommandFailure,
    /// The scheduler missed its deadline persistently (see the deadline policy).
    DeadlineMiss,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::Anomaly(kind) => fmt::Display::fmt(kind, f),
            IssueKind::CommandFailure => write!(f, "command_failure"),
            IssueKind::DeadlineMiss => write!(f, "deadline_miss"),
        }
    }
}

/// A safety-relevant finding collected during one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyIssue {
    pub channel: String,
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
}

/// Process-wide safety state driven by the safety monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    #[default]
    Normal,
    Warning,
    /// Latched until an explicit operator reset.
    EmergencyStop,
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyState::Normal => write!(f, "normal"),
            SafetyState::Warning => write!(f, "warning"),
            SafetyState::EmergencyStop => write!(f, "emergency_stop"),
        }
    }
}

/// Operating mode requests accepted over the inbound command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeCommand {
    Run,
    Pause,
    /// Operator acknowledgement after an emergency stop.
    ResetAfterEstop,
}

/// Inbound control interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum ControlCommand {
    /// Move `channel` toward `target_rad`.
    SetTarget { channel: String, target_rad: f64 },
    Mode(ModeCommand),
}

/// Per-channel slice of a [`TelemetrySnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTelemetry {
    pub channel: String,
    pub position: f64,
    pub velocity: f64,
    pub torque: f64,
    pub temperature: f64,
    /// Fused position estimate fed to the controller.
    pub estimate: f64,
    pub command: f64,
    pub anomalies: Vec<AnomalyKind>,
}

/// Scheduler counters included in every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub cycle_count: u64,
    pub missed_deadlines: u64,
}

/// Outbound telemetry, one per cycle.  Formatting and persistence are the
/// consumer's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: Duration,
    pub channels: Vec<ChannelTelemetry>,
    pub safety_state: SafetyState,
    pub scheduler: SchedulerStats,
}

/// Envelope for everything published on the outbound event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"rtjoint-runtime::control_loop"`
    pub source: String,
    /// Control cycle that produced the event.
    pub cycle: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, cycle: u64, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            cycle,
            payload,
        }
    }
}

/// Variants of data routed over the outbound event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    SafetyIssue(SafetyIssue),
    SafetyStateChanged {
        from: SafetyState,
        to: SafetyState,
        /// The issue set that caused the transition (empty on recovery/reset).
        issues: Vec<SafetyIssue>,
    },
    Telemetry(TelemetrySnapshot),
}

/// Crate-wide error type for configuration, command and channel failures.
///
/// Transient hardware faults never appear here: they are masked inside the
/// channel.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Emergency stop is latched; an operator reset is required")]
    EmergencyStopLatched,

    #[error("Reset rejected while safety state is {0}")]
    ResetRejected(SafetyState),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Queue error: {0}")]
    Channel(String),
}
