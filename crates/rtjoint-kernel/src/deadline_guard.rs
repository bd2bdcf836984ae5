//! [`DeadlineGuard`] – persistent-overrun escalation.
//!
//! A single missed deadline is a diagnostic.  A streak of them may not be:
//! the guard counts consecutive misses and, once the streak reaches
//! [`DeadlinePolicy::consecutive_misses`], produces a `deadline_miss`
//! [`SafetyIssue`] every cycle until the scheduler is back on time.
//!
//! # Example
//!
//! ```rust
//! use rtjoint_kernel::deadline_guard::{DeadlineAction, DeadlineGuard, DeadlinePolicy};
//! use rtjoint_types::Severity;
//!
//! let mut guard = DeadlineGuard::new(DeadlinePolicy {
//!     action: DeadlineAction::Warn,
//!     consecutive_misses: 2,
//! });
//! assert!(guard.record(true).is_none());
//! let issue = guard.record(true).unwrap();
//! assert_eq!(issue.severity, Severity::Medium);
//! assert!(guard.record(false).is_none());
//! assert_eq!(guard.streak(), 0);
//! ```

use rtjoint_types::{ControlError, IssueKind, SafetyIssue, Severity};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Channel name used on deadline issues; they belong to no joint.
pub const SCHEDULER_CHANNEL: &str = "scheduler";

/// What a persistent overrun turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineAction {
    /// Count only.
    #[default]
    Ignore,
    /// Medium-severity issue: the monitor moves to `Warning`.
    Warn,
    /// High-severity issue: the monitor latches the emergency stop.
    EmergencyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlinePolicy {
    pub action: DeadlineAction,
    /// Streak length at which the action applies.
    pub consecutive_misses: u32,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            action: DeadlineAction::Ignore,
            consecutive_misses: 10,
        }
    }
}

impl DeadlinePolicy {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.consecutive_misses == 0 {
            return Err(ControlError::InvalidConfig(
                "deadline_policy.consecutive_misses must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Tracks the current streak of missed deadlines.
#[derive(Debug, Clone, Default)]
pub struct DeadlineGuard {
    policy: DeadlinePolicy,
    streak: u32,
}

impl DeadlineGuard {
    pub fn new(policy: DeadlinePolicy) -> Self {
        Self { policy, streak: 0 }
    }

    pub fn policy(&self) -> &DeadlinePolicy {
        &self.policy
    }

    /// Current number of consecutive misses.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Record whether this cycle missed its deadline.  Returns the issue to
    /// feed into the safety monitor, if the policy calls for one.
    pub fn record(&mut self, missed: bool) -> Option<SafetyIssue> {
        if !missed {
            self.streak = 0;
            return None;
        }
        self.streak = self.streak.saturating_add(1);

        let severity = match self.policy.action {
            DeadlineAction::Ignore => return None,
            DeadlineAction::Warn => Severity::Medium,
            DeadlineAction::EmergencyStop => Severity::High,
        };
        if self.streak < self.policy.consecutive_misses {
            return None;
        }

        warn!(streak = self.streak, ?severity, "persistent deadline overrun escalated");
        Some(SafetyIssue {
            channel: SCHEDULER_CHANNEL.to_string(),
            kind: IssueKind::DeadlineMiss,
            severity,
            message: format!("{} consecutive missed deadlines", self.streak),
        })
    }
}
