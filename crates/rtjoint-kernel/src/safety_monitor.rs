//! [`SafetyMonitor`] – the process-wide safety state machine.
//!
//! ```text
//!            medium only             high
//!   Normal ──────────────▶ Warning ───────▶ EmergencyStop
//!     ▲  │                    │                   │
//!     │  └────────── high ────┼──────────────────▶│
//!     └──── zero issues ──────┘                   │
//!     ▲                                           │
//!     └──────────── explicit reset() ─────────────┘
//! ```
//!
//! `EmergencyStop` is latched: no cycle result, however clean, leaves it.
//! Only [`SafetyMonitor::reset`] does, and only from that state.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rtjoint_hal::clock::VirtualClock;
//! use rtjoint_hal::sim::{SimChannelConfig, SimRegistry};
//! use rtjoint_kernel::safety_monitor::{SafetyMonitor, SeverityPolicy};
//! use rtjoint_types::{IssueKind, AnomalyKind, SafetyIssue, SafetyState, Severity};
//!
//! let mut registry = SimRegistry::builder(Arc::new(VirtualClock::new()))
//!     .with_channel(SimChannelConfig::new("hip_left"))
//!     .build();
//! let mut monitor = SafetyMonitor::new(SeverityPolicy::default());
//!
//! let overheat = SafetyIssue {
//!     channel: "hip_left".into(),
//!     kind: IssueKind::Anomaly(AnomalyKind::Overheat),
//!     severity: Severity::High,
//!     message: "Overheating: 70.0°C".into(),
//! };
//! let eval = monitor.evaluate(&[overheat], &mut registry);
//! assert!(eval.entered_estop);
//! assert_eq!(monitor.state(), SafetyState::EmergencyStop);
//!
//! // A clean cycle does not clear the latch.
//! monitor.evaluate(&[], &mut registry);
//! assert_eq!(monitor.state(), SafetyState::EmergencyStop);
//! assert!(monitor.reset().is_ok());
//! assert_eq!(monitor.state(), SafetyState::Normal);
//! ```

use rtjoint_hal::registry::ChannelRegistry;
use rtjoint_types::{
    AnomalyKind, AnomalyReport, ControlError, IssueKind, SafetyIssue, SafetyState, Severity,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ────────────────────────────────────────────────────────────────────────────
// Severity policy
// ────────────────────────────────────────────────────────────────────────────

/// How an active anomaly is escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// Not a safety issue; other layers (e.g. the controller) handle it.
    Ignore,
    Medium,
    High,
}

impl Escalation {
    pub fn severity(self) -> Option<Severity> {
        match self {
            Escalation::Ignore => None,
            Escalation::Medium => Some(Severity::Medium),
            Escalation::High => Some(Severity::High),
        }
    }
}

/// Maps each anomaly kind to its escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPolicy {
    pub position_limit: Escalation,
    pub high_velocity: Escalation,
    pub overheat: Escalation,
    pub high_torque: Escalation,
    pub thermal_risk: Escalation,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            position_limit: Escalation::Ignore,
            high_velocity: Escalation::Medium,
            overheat: Escalation::High,
            high_torque: Escalation::Medium,
            thermal_risk: Escalation::Medium,
        }
    }
}

impl SeverityPolicy {
    pub fn severity_for(&self, kind: AnomalyKind) -> Option<Severity> {
        let escalation = match kind {
            AnomalyKind::PositionLimit => self.position_limit,
            AnomalyKind::HighVelocity => self.high_velocity,
            AnomalyKind::Overheat => self.overheat,
            AnomalyKind::HighTorque => self.high_torque,
            AnomalyKind::ThermalRisk => self.thermal_risk,
        };
        escalation.severity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of one [`SafetyMonitor::evaluate`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub previous: SafetyState,
    pub current: SafetyState,
    /// `true` only on the cycle that latched the emergency stop.
    pub entered_estop: bool,
    /// The issue set that was evaluated.
    pub issues: Vec<SafetyIssue>,
}

impl Evaluation {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Aggregates issues and owns the single [`SafetyState`].
#[derive(Debug, Clone, Default)]
pub struct SafetyMonitor {
    policy: SeverityPolicy,
    state: SafetyState,
    estop_entries: u64,
}

impl SafetyMonitor {
    /// Start in [`SafetyState::Normal`].
    pub fn new(policy: SeverityPolicy) -> Self {
        Self {
            policy,
            state: SafetyState::Normal,
            estop_entries: 0,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn policy(&self) -> &SeverityPolicy {
        &self.policy
    }

    /// How many times the emergency stop has been entered (and broadcast).
    pub fn estop_entries(&self) -> u64 {
        self.estop_entries
    }

    /// Turn the active anomalies of `reports` into issues, in report order.
    /// Anomalies whose escalation is [`Escalation::Ignore`] are skipped.
    pub fn collect_issues(&self, reports: &[AnomalyReport]) -> Vec<SafetyIssue> {
        let mut issues = Vec::new();
        for report in reports {
            for (kind, advisory) in report.active() {
                if let Some(severity) = self.policy.severity_for(kind) {
                    issues.push(SafetyIssue {
                        channel: report.channel.clone(),
                        kind: IssueKind::Anomaly(kind),
                        severity,
                        message: advisory.to_string(),
                    });
                }
            }
        }
        issues
    }

    /// Apply one cycle's issue set to the state machine.
    ///
    /// On the transition into `EmergencyStop`, every channel in `registry`
    /// receives [`emergency_stop`][rtjoint_hal::HardwareChannel::emergency_stop]
    /// before this call returns.  Staying in `EmergencyStop` broadcasts
    /// nothing.
    pub fn evaluate(&mut self, issues: &[SafetyIssue], registry: &mut ChannelRegistry) -> Evaluation {
        let previous = self.state;
        let worst = issues.iter().map(|i| i.severity).max();

        let next = match (previous, worst) {
            (SafetyState::EmergencyStop, _) => SafetyState::EmergencyStop,
            (_, Some(Severity::High)) => SafetyState::EmergencyStop,
            (_, Some(Severity::Medium)) => SafetyState::Warning,
            (_, None) => SafetyState::Normal,
        };

        let entered_estop = previous != SafetyState::EmergencyStop && next == SafetyState::EmergencyStop;
        if entered_estop {
            let stopped = registry.emergency_stop_all();
            self.estop_entries += 1;
            error!(
                from = %previous,
                channels = stopped,
                issues = issues.len(),
                "emergency stop latched"
            );
        } else if next != previous {
            info!(from = %previous, to = %next, issues = issues.len(), "safety state changed");
        }
        self.state = next;

        Evaluation {
            previous,
            current: next,
            entered_estop,
            issues: issues.to_vec(),
        }
    }

    /// `Ok` unless the emergency stop is latched.
    pub fn ensure_can_command(&self) -> Result<(), ControlError> {
        match self.state {
            SafetyState::EmergencyStop => Err(ControlError::EmergencyStopLatched),
            _ => Ok(()),
        }
    }

    /// Operator acknowledgement after an emergency stop.  Returns the monitor
    /// to `Normal`; rejected in any other state.
    pub fn reset(&mut self) -> Result<(), ControlError> {
        if self.state != SafetyState::EmergencyStop {
            return Err(ControlError::ResetRejected(self.state));
        }
        info!("emergency stop reset by operator");
        self.state = SafetyState::Normal;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rtjoint_hal::clock::VirtualClock;
    use rtjoint_hal::sim::{FaultInjection, SimChannelConfig, SimRegistry};
    use rtjoint_types::{AnomalyFlag, SignalKind};

    use super::*;

    fn registry() -> ChannelRegistry {
        SimRegistry::builder(Arc::new(VirtualClock::new()))
            .with_channel(SimChannelConfig::new("hip_left").with_faults(FaultInjection::none()))
            .with_channel(SimChannelConfig::new("knee_left").with_faults(FaultInjection::none()))
            .build()
    }

    fn issue(severity: Severity) -> SafetyIssue {
        SafetyIssue {
            channel: "hip_left".into(),
            kind: IssueKind::Anomaly(AnomalyKind::HighTorque),
            severity,
            message: "test".into(),
        }
    }

    fn report(channel: &str, active: &[AnomalyKind]) -> AnomalyReport {
        let mut report = AnomalyReport::new(channel);
        for kind in AnomalyKind::ALL {
            let on = active.contains(&kind);
            report.flags.insert(
                kind,
                AnomalyFlag {
                    active: on,
                    advisory: on.then(|| format!("{kind} advisory")),
                },
            );
        }
        report
    }

    /// Spin a channel up so an emergency stop has something to zero.
    fn spin(registry: &mut ChannelRegistry) {
        for ch in registry.channels_mut() {
            assert!(ch.write(15.0));
        }
    }

    #[test]
    fn default_policy_matches_known_escalations() {
        let policy = SeverityPolicy::default();
        assert_eq!(policy.severity_for(AnomalyKind::Overheat), Some(Severity::High));
        assert_eq!(policy.severity_for(AnomalyKind::HighTorque), Some(Severity::Medium));
        assert_eq!(policy.severity_for(AnomalyKind::ThermalRisk), Some(Severity::Medium));
        assert_eq!(policy.severity_for(AnomalyKind::HighVelocity), Some(Severity::Medium));
        assert_eq!(policy.severity_for(AnomalyKind::PositionLimit), None);
    }

    #[test]
    fn collect_issues_skips_ignored_and_inactive() {
        let monitor = SafetyMonitor::default();
        let reports = vec![
            report("hip_left", &[AnomalyKind::PositionLimit]),
            report("knee_left", &[AnomalyKind::Overheat, AnomalyKind::ThermalRisk]),
        ];
        let issues = monitor.collect_issues(&reports);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.channel == "knee_left"));
        assert_eq!(issues[0].kind, IssueKind::Anomaly(AnomalyKind::Overheat));
        assert_eq!(issues[0].severity, Severity::High);
        assert_eq!(issues[0].message, "overheat advisory");
    }

    #[test]
    fn medium_moves_to_warning_and_clean_cycle_recovers() {
        let mut reg = registry();
        let mut monitor = SafetyMonitor::default();

        let eval = monitor.evaluate(&[issue(Severity::Medium)], &mut reg);
        assert_eq!(eval.previous, SafetyState::Normal);
        assert_eq!(eval.current, SafetyState::Warning);
        assert!(eval.changed());
        assert!(!eval.entered_estop);

        let eval = monitor.evaluate(&[issue(Severity::Medium)], &mut reg);
        assert!(!eval.changed());

        let eval = monitor.evaluate(&[], &mut reg);
        assert_eq!(eval.current, SafetyState::Normal);
    }

    #[test]
    fn high_from_warning_enters_estop() {
        let mut reg = registry();
        let mut monitor = SafetyMonitor::default();
        monitor.evaluate(&[issue(Severity::Medium)], &mut reg);
        let eval = monitor.evaluate(&[issue(Severity::Medium), issue(Severity::High)], &mut reg);
        assert_eq!(eval.previous, SafetyState::Warning);
        assert!(eval.entered_estop);
        assert_eq!(eval.issues.len(), 2);
    }

    #[test]
    fn estop_is_latched_across_clean_cycles() {
        let mut reg = registry();
        let mut monitor = SafetyMonitor::default();
        monitor.evaluate(&[issue(Severity::High)], &mut reg);
        for _ in 0..50 {
            let eval = monitor.evaluate(&[], &mut reg);
            assert_eq!(eval.current, SafetyState::EmergencyStop);
            assert!(!eval.entered_estop);
        }
        assert_eq!(
            monitor.ensure_can_command(),
            Err(ControlError::EmergencyStopLatched)
        );
    }

    #[test]
    fn estop_broadcast_happens_exactly_once_per_entry() {
        let mut reg = registry();
        spin(&mut reg);
        let mut monitor = SafetyMonitor::default();

        monitor.evaluate(&[issue(Severity::High)], &mut reg);
        for ch in reg.channels_mut() {
            assert_eq!(ch.read(SignalKind::Torque).value, 0.0);
            assert_eq!(ch.read(SignalKind::Velocity).value, 0.0);
        }
        assert_eq!(monitor.estop_entries(), 1);

        // Second consecutive high cycle: no further broadcast.
        let eval = monitor.evaluate(&[issue(Severity::High)], &mut reg);
        assert!(!eval.entered_estop);
        assert_eq!(monitor.estop_entries(), 1);

        // A reset and a fresh high issue is a new entry.
        monitor.reset().unwrap();
        monitor.evaluate(&[issue(Severity::High)], &mut reg);
        assert_eq!(monitor.estop_entries(), 2);
    }

    #[test]
    fn reset_is_rejected_outside_estop() {
        let mut reg = registry();
        let mut monitor = SafetyMonitor::default();
        assert_eq!(
            monitor.reset(),
            Err(ControlError::ResetRejected(SafetyState::Normal))
        );
        monitor.evaluate(&[issue(Severity::Medium)], &mut reg);
        assert_eq!(
            monitor.reset(),
            Err(ControlError::ResetRejected(SafetyState::Warning))
        );
        assert!(monitor.ensure_can_command().is_ok());
    }

    #[test]
    fn policy_can_promote_position_limit() {
        let policy = SeverityPolicy {
            position_limit: Escalation::High,
            ..SeverityPolicy::default()
        };
        let monitor = SafetyMonitor::new(policy);
        let issues = monitor.collect_issues(&[report("hip_left", &[AnomalyKind::PositionLimit])]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::High);
    }
}
