//! `rtjoint-kernel` – Safety supervision
//!
//! The kernel does not control anything.  It decides whether control is
//! allowed at all.
//!
//! # Modules
//!
//! - [`safety_monitor`] – [`SafetyMonitor`][safety_monitor::SafetyMonitor]:
//!   turns per-channel anomaly reports into severity-classified issues and
//!   drives the `Normal → Warning → EmergencyStop` state machine, broadcasting
//!   the emergency stop to every channel exactly once per entry.
//! - [`deadline_guard`] – [`DeadlineGuard`][deadline_guard::DeadlineGuard]:
//!   escalates persistent scheduler overruns into safety issues according to
//!   a configurable [`DeadlinePolicy`][deadline_guard::DeadlinePolicy].

pub mod deadline_guard;
pub mod safety_monitor;

pub use deadline_guard::{DeadlineAction, DeadlineGuard, DeadlinePolicy};
pub use safety_monitor::{Escalation, Evaluation, SafetyMonitor, SeverityPolicy};
