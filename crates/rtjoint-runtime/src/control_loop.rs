//! [`ControlLoop`] – the cycle orchestrator.
//!
//! The loop is the sole owner and mutator of the hardware registry, the
//! reading buffers, the estimators and the safety monitor.  Every cycle:
//!
//! 1. **Wait** – [`FixedRateScheduler`] sleeps until the next deadline, or
//!    reports a miss and resynchronises.
//! 2. **Commands** – every pending [`ControlCommand`] is applied in arrival
//!    order.
//! 3. **Read** – each channel samples position, velocity, torque and
//!    temperature; readings go into the per-signal [`SignalBuffer`]s.
//! 4. **Estimate** – readings are fused into the [`EstimatorBank`].
//! 5. **Classify** – [`PerceptionUnit`] produces one [`AnomalyReport`] per
//!    channel from the raw readings.
//! 6. **Monitor** – anomaly and deadline issues go to the [`SafetyMonitor`],
//!    which may latch the emergency stop (broadcasting it to every channel
//!    before anything else happens).
//! 7. **Control** – [`JointController`] computes a command per channel from
//!    the estimates.  In `EmergencyStop` every command is exactly zero.
//! 8. **Write** – commands are written unless the loop is paused.  Failed
//!    writes become `command_failure` issues.
//! 9. **Publish** – issues, state transitions and a telemetry snapshot go
//!    out on the [`EventBus`].
//!
//! Channel I/O (steps 3 and 8) optionally fans out to one scoped thread per
//! channel; the scope join is the barrier before safety evaluation.  A
//! channel that panics takes the loop down with it in either mode: a cycle
//! never proceeds with a channel's readings or write silently missing.

use std::collections::BTreeMap;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rtjoint_hal::channel::HardwareChannel;
use rtjoint_hal::clock::Clock;
use rtjoint_hal::controller::{ControlInput, ControlOutput, JointController};
use rtjoint_hal::registry::ChannelRegistry;
use rtjoint_hal::sim::SimRegistry;
use rtjoint_kernel::deadline_guard::DeadlineGuard;
use rtjoint_kernel::safety_monitor::SafetyMonitor;
use rtjoint_middleware::bus::{EventBus, EventReceiver, Topic};
use rtjoint_middleware::command::{CommandQueue, CommandReceiver, CommandSender};
use rtjoint_perception::buffer::SignalBuffer;
use rtjoint_perception::classifier::{PerceptionUnit, ReadingSet};
use rtjoint_perception::estimator::EstimatorBank;
use rtjoint_types::{
    AnomalyKind, AnomalyReport, ChannelTelemetry, ControlCommand, ControlError, Event,
    EventPayload, IssueKind, ModeCommand, Reading, SafetyIssue, SafetyState, Severity, SignalKind,
    TelemetrySnapshot,
};
use serde::Serialize;
use tracing::{Span, debug, error, info, instrument, warn};

use crate::config::{ControlLoopConfig, ExitPolicy};
use crate::scheduler::{FixedRateScheduler, JitterStats};

/// `source` of every event the loop publishes.
pub const EVENT_SOURCE: &str = "rtjoint-runtime::control_loop";

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to one channel's actuator this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOutput {
    pub channel: String,
    pub output: ControlOutput,
    /// `None` when no write was issued (paused), otherwise whether the
    /// hardware applied it.
    pub applied: Option<bool>,
}

/// Result of one [`ControlLoop::tick`].
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub missed_deadline: bool,
    pub previous_state: SafetyState,
    pub safety_state: SafetyState,
    /// `true` only on the cycle that latched the emergency stop.
    pub entered_estop: bool,
    /// Every issue of the cycle, command failures included.
    pub issues: Vec<SafetyIssue>,
    pub reports: Vec<AnomalyReport>,
    pub outputs: Vec<ChannelOutput>,
    /// Commands from the inbound queue that were refused.
    pub rejected: Vec<ControlError>,
    pub snapshot: TelemetrySnapshot,
}

/// Returned by [`ControlLoop::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub missed_deadlines: u64,
    pub final_state: SafetyState,
    pub estop_entries: u64,
    /// Masked transient faults per channel, in sampling order.
    pub fault_counts: Vec<(String, u64)>,
    pub jitter: JitterStats,
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-channel state owned by the loop
// ─────────────────────────────────────────────────────────────────────────────

struct JointSlot {
    id: String,
    target: f64,
    controller: JointController,
    buffers: BTreeMap<SignalKind, SignalBuffer>,
    last_command: f64,
}

/// Raw I/O results for one channel, collected before the barrier.
struct Sample {
    readings: Vec<Reading>,
    noise: [f64; 4],
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct ControlLoop {
    clock: Arc<dyn Clock>,
    registry: ChannelRegistry,
    slots: Vec<JointSlot>,
    estimators: EstimatorBank,
    perception: PerceptionUnit,
    monitor: SafetyMonitor,
    deadline_guard: DeadlineGuard,
    scheduler: FixedRateScheduler,
    commands: CommandReceiver,
    command_tx: CommandSender,
    bus: EventBus,
    exit_policy: ExitPolicy,
    parallel_io: bool,
    paused: bool,
    /// Full cycles completed while already in `EmergencyStop`.
    estop_cycles: u64,
}

impl ControlLoop {
    /// Build a loop over simulated channels described by `config`.
    pub fn new(config: ControlLoopConfig, clock: Arc<dyn Clock>) -> Result<Self, ControlError> {
        config.validate()?;
        let registry = config
            .channels
            .iter()
            .fold(
                SimRegistry::builder(Arc::clone(&clock)).seed(config.seed),
                |builder, spec| builder.with_channel(spec.sim_config()),
            )
            .build();
        Self::with_registry(config, clock, registry)
    }

    /// Build a loop over an existing registry (real or custom hardware).
    ///
    /// Channel specs in `config` supply targets and gain overrides for the
    /// channels they name; other channels use the loop-wide defaults.
    pub fn with_registry(
        config: ControlLoopConfig,
        clock: Arc<dyn Clock>,
        registry: ChannelRegistry,
    ) -> Result<Self, ControlError> {
        if registry.is_empty() {
            return Err(ControlError::InvalidConfig("registry has no channels".into()));
        }
        config.deadline_policy.validate()?;
        config.thresholds.validate()?;
        config.gains.validate()?;

        let slots = registry
            .ids()
            .map(|id| {
                let spec = config.channels.iter().find(|s| s.id == id);
                let gains = spec.map_or(config.gains, |s| config.gains_for(s));
                let buffers = SignalKind::ALL
                    .into_iter()
                    .map(|kind| (kind, SignalBuffer::new(config.buffer_capacity)))
                    .collect();
                JointSlot {
                    id: id.to_string(),
                    target: spec.map_or(0.0, |s| s.target),
                    controller: JointController::new(gains),
                    buffers,
                    last_command: 0.0,
                }
            })
            .collect();

        let scheduler = FixedRateScheduler::new(Arc::clone(&clock), config.frequency_hz)?;
        let (command_tx, commands) = CommandQueue::bounded(config.command_capacity);

        info!(
            channels = registry.len(),
            frequency_hz = config.frequency_hz,
            parallel_io = config.parallel_io,
            "control loop initialised"
        );

        Ok(Self {
            clock,
            registry,
            slots,
            estimators: EstimatorBank::new(config.estimator),
            perception: PerceptionUnit::new(config.thresholds),
            monitor: SafetyMonitor::new(config.severity_policy),
            deadline_guard: DeadlineGuard::new(config.deadline_policy),
            scheduler,
            commands,
            command_tx,
            bus: EventBus::new(config.event_capacity),
            exit_policy: config.exit_policy,
            parallel_io: config.parallel_io,
            paused: false,
            estop_cycles: 0,
        })
    }

    // ── accessors ──────────────────────────────────────────────────────────

    /// A producer handle for the inbound command queue.
    pub fn command_sender(&self) -> CommandSender {
        self.command_tx.clone()
    }

    /// Subscribe to an outbound topic.
    pub fn subscribe(&self, topic: Topic) -> EventReceiver {
        self.bus.subscribe_to(topic)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn safety_state(&self) -> SafetyState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    pub fn scheduler(&self) -> &FixedRateScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn estimators(&self) -> &EstimatorBank {
        &self.estimators
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn target(&self, channel: &str) -> Option<f64> {
        self.slot(channel).map(|s| s.target)
    }

    /// The reading history of one (channel, signal) pair.
    pub fn buffer(&self, channel: &str, kind: SignalKind) -> Option<&SignalBuffer> {
        self.slot(channel).and_then(|s| s.buffers.get(&kind))
    }

    fn slot(&self, channel: &str) -> Option<&JointSlot> {
        self.slots.iter().find(|s| s.id == channel)
    }

    // ── commands ───────────────────────────────────────────────────────────

    /// Apply one command immediately.
    pub fn apply_command(&mut self, command: ControlCommand) -> Result<(), ControlError> {
        match command {
            ControlCommand::SetTarget { channel, target_rad } => {
                if !target_rad.is_finite() {
                    return Err(ControlError::InvalidConfig(format!(
                        "target {target_rad} for {channel} is not finite"
                    )));
                }
                let slot = self
                    .slots
                    .iter_mut()
                    .find(|s| s.id == channel)
                    .ok_or_else(|| ControlError::UnknownChannel(channel.clone()))?;
                slot.target = target_rad;
                debug!(channel = %channel, target_rad, "target updated");
                Ok(())
            }
            ControlCommand::Mode(ModeCommand::Run) => {
                self.monitor.ensure_can_command()?;
                if self.paused {
                    info!("control resumed");
                }
                self.paused = false;
                Ok(())
            }
            ControlCommand::Mode(ModeCommand::Pause) => {
                if !self.paused {
                    info!("control paused; sensing and safety continue");
                }
                self.paused = true;
                Ok(())
            }
            ControlCommand::Mode(ModeCommand::ResetAfterEstop) => {
                self.monitor.reset()?;
                self.estop_cycles = 0;
                self.publish(
                    Topic::SafetyEvents,
                    EventPayload::SafetyStateChanged {
                        from: SafetyState::EmergencyStop,
                        to: self.monitor.state(),
                        issues: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn drain_commands(&mut self) -> Vec<ControlError> {
        let mut rejected = Vec::new();
        for command in self.commands.drain() {
            if let Err(e) = self.apply_command(command) {
                warn!(error = %e, "command rejected");
                rejected.push(e);
            }
        }
        rejected
    }

    // ── the cycle ──────────────────────────────────────────────────────────

    /// Wait for the next period and run one full cycle.
    #[instrument(name = "tick", skip_all, fields(cycle = tracing::field::Empty))]
    pub fn tick(&mut self) -> CycleReport {
        let tick = self.scheduler.wait_for_next_cycle();
        let cycle = tick.cycle;
        Span::current().record("cycle", cycle);

        let rejected = self.drain_commands();

        // Read, buffer, estimate.
        let samples = sample_all(self.registry.channels_mut(), self.parallel_io);
        let mut sets = Vec::with_capacity(samples.len());
        for (slot, sample) in self.slots.iter_mut().zip(samples) {
            for reading in &sample.readings {
                let noise = sample.noise[kind_index(reading.kind)];
                self.estimators
                    .update(&slot.id, reading.kind, reading.value, noise);
            }
            let set = ReadingSet::from_readings(&sample.readings);
            for reading in sample.readings {
                if let Some(buffer) = slot.buffers.get_mut(&reading.kind) {
                    buffer.append(reading);
                }
            }
            sets.push(set);
        }

        // Classify and evaluate.
        let reports: Vec<AnomalyReport> = self
            .slots
            .iter()
            .zip(self.registry.iter())
            .zip(&sets)
            .map(|((slot, channel), set)| self.perception.classify(&slot.id, set, channel.limits()))
            .collect();
        let mut issues = self.monitor.collect_issues(&reports);
        if let Some(issue) = self.deadline_guard.record(tick.missed) {
            issues.push(issue);
        }
        let evaluation = self.monitor.evaluate(&issues, &mut self.registry);
        if evaluation.previous == SafetyState::EmergencyStop {
            self.estop_cycles += 1;
        }
        let state = evaluation.current;

        // Control.
        let outputs: Vec<ControlOutput> = self
            .slots
            .iter()
            .zip(&reports)
            .map(|(slot, report)| {
                let position = self
                    .estimators
                    .estimate(&slot.id, SignalKind::Position)
                    .unwrap_or(0.0);
                let velocity = self
                    .estimators
                    .estimate(&slot.id, SignalKind::Velocity)
                    .unwrap_or(0.0);
                slot.controller.compute(&ControlInput {
                    target: slot.target,
                    position,
                    velocity,
                    position_anomaly: report.is_active(AnomalyKind::PositionLimit),
                    safety_state: state,
                })
            })
            .collect();

        // Write.
        let applied: Vec<Option<bool>> = if self.paused {
            vec![None; outputs.len()]
        } else {
            let commands: Vec<f64> = outputs.iter().map(|o| o.command).collect();
            write_all(self.registry.channels_mut(), &commands, self.parallel_io)
                .into_iter()
                .map(Some)
                .collect()
        };

        let mut failures = Vec::new();
        let mut channel_outputs = Vec::with_capacity(outputs.len());
        for ((slot, output), applied) in self.slots.iter_mut().zip(outputs).zip(applied) {
            slot.last_command = if applied.is_some() { output.command } else { 0.0 };
            if applied == Some(false) {
                warn!(channel = %slot.id, command = output.command, cycle, "actuator command failed");
                failures.push(SafetyIssue {
                    channel: slot.id.clone(),
                    kind: IssueKind::CommandFailure,
                    severity: Severity::Medium,
                    message: format!("command {:.3} N·m not applied", output.command),
                });
            }
            channel_outputs.push(ChannelOutput {
                channel: slot.id.clone(),
                output,
                applied,
            });
        }
        issues.extend(failures);

        // Publish.
        let snapshot = self.snapshot(tick.fired_at, &sets, &reports, state);
        for issue in &issues {
            self.publish(Topic::SafetyEvents, EventPayload::SafetyIssue(issue.clone()));
        }
        if evaluation.changed() {
            self.publish(
                Topic::SafetyEvents,
                EventPayload::SafetyStateChanged {
                    from: evaluation.previous,
                    to: evaluation.current,
                    issues: evaluation.issues.clone(),
                },
            );
        }
        self.publish(Topic::Telemetry, EventPayload::Telemetry(snapshot.clone()));

        CycleReport {
            cycle,
            missed_deadline: tick.missed,
            previous_state: evaluation.previous,
            safety_state: state,
            entered_estop: evaluation.entered_estop,
            issues,
            reports,
            outputs: channel_outputs,
            rejected,
            snapshot,
        }
    }

    /// Cycle until `stop` is raised or the exit policy ends the run.
    pub fn run(&mut self, stop: &AtomicBool) -> RunSummary {
        info!(exit_policy = ?self.exit_policy, "control loop running");
        while !stop.load(Ordering::Relaxed) {
            self.tick();
            if self.exit_policy == ExitPolicy::StopAfterEmergencyCycle && self.estop_cycles >= 1 {
                info!("emergency stop held for a full cycle; leaving control loop");
                break;
            }
        }
        let summary = self.summary();
        info!(
            cycles = summary.cycles,
            missed_deadlines = summary.missed_deadlines,
            final_state = %summary.final_state,
            "control loop stopped"
        );
        summary
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            cycles: self.scheduler.cycle_count(),
            missed_deadlines: self.scheduler.missed_deadlines(),
            final_state: self.monitor.state(),
            estop_entries: self.monitor.estop_entries(),
            fault_counts: self
                .registry
                .iter()
                .map(|c| (c.id().to_string(), c.fault_count()))
                .collect(),
            jitter: self.scheduler.jitter(),
        }
    }

    fn snapshot(
        &self,
        timestamp: Duration,
        sets: &[ReadingSet],
        reports: &[AnomalyReport],
        safety_state: SafetyState,
    ) -> TelemetrySnapshot {
        let channels = self
            .slots
            .iter()
            .zip(sets)
            .zip(reports)
            .map(|((slot, set), report)| ChannelTelemetry {
                channel: slot.id.clone(),
                position: set.position.unwrap_or(f64::NAN),
                velocity: set.velocity.unwrap_or(f64::NAN),
                torque: set.torque.unwrap_or(f64::NAN),
                temperature: set.temperature.unwrap_or(f64::NAN),
                estimate: self
                    .estimators
                    .estimate(&slot.id, SignalKind::Position)
                    .unwrap_or(f64::NAN),
                command: slot.last_command,
                anomalies: report.active().map(|(kind, _)| kind).collect(),
            })
            .collect();
        TelemetrySnapshot {
            timestamp,
            channels,
            safety_state,
            scheduler: self.scheduler.stats(),
        }
    }

    fn publish(&self, topic: Topic, payload: EventPayload) {
        let event = Event::new(EVENT_SOURCE, self.scheduler.cycle_count(), payload);
        if let Err(e) = self.bus.publish_to(topic, event) {
            debug!(error = %e, ?topic, "event dropped");
        }
    }

    /// The clock driving this loop.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel I/O fan-out
// ─────────────────────────────────────────────────────────────────────────────

fn kind_index(kind: SignalKind) -> usize {
    match kind {
        SignalKind::Position => 0,
        SignalKind::Velocity => 1,
        SignalKind::Torque => 2,
        SignalKind::Temperature => 3,
    }
}

fn sample_one(channel: &mut dyn HardwareChannel) -> Sample {
    let mut noise = [0.0; 4];
    let readings = SignalKind::ALL
        .into_iter()
        .map(|kind| {
            noise[kind_index(kind)] = channel.measurement_noise(kind);
            channel.read(kind)
        })
        .collect();
    Sample { readings, noise }
}

fn sample_all(channels: &mut [Box<dyn HardwareChannel>], parallel: bool) -> Vec<Sample> {
    if !parallel || channels.len() < 2 {
        return channels.iter_mut().map(|c| sample_one(c.as_mut())).collect();
    }
    thread::scope(|scope| {
        let handles: Vec<_> = channels
            .iter_mut()
            .map(|c| scope.spawn(move || sample_one(c.as_mut())))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(slot, h)| join_worker(h, slot, "read"))
            .collect()
    })
}

fn write_all(channels: &mut [Box<dyn HardwareChannel>], commands: &[f64], parallel: bool) -> Vec<bool> {
    if !parallel || channels.len() < 2 {
        return channels
            .iter_mut()
            .zip(commands)
            .map(|(c, &command)| c.write(command))
            .collect();
    }
    thread::scope(|scope| {
        let handles: Vec<_> = channels
            .iter_mut()
            .zip(commands)
            .map(|(c, &command)| scope.spawn(move || c.write(command)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(slot, h)| join_worker(h, slot, "write"))
            .collect()
    })
}

/// Re-raise a worker panic on the loop thread, as the sequential path would.
fn join_worker<T>(handle: thread::ScopedJoinHandle<'_, T>, slot: usize, op: &str) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(payload) => {
            error!(slot, op, "channel I/O worker panicked");
            panic::resume_unwind(payload)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;
    use std::sync::atomic::AtomicU64;

    use rtjoint_hal::channel::{ChannelLimits, FaultRecord, JointState};
    use rtjoint_hal::clock::VirtualClock;
    use rtjoint_hal::controller::ControlLaw;
    use rtjoint_hal::sim::FaultInjection;
    use rtjoint_kernel::deadline_guard::{DeadlineAction, DeadlinePolicy};

    use super::*;
    use crate::config::ChannelSpec;

    fn quiet(id: &str, initial: JointState) -> ChannelSpec {
        ChannelSpec {
            faults: FaultInjection::none(),
            initial,
            ..ChannelSpec::new(id)
        }
    }

    fn build(channels: Vec<ChannelSpec>) -> (Arc<VirtualClock>, ControlLoop) {
        let clock = Arc::new(VirtualClock::new());
        let config = ControlLoopConfig::default().with_channels(channels);
        let control = ControlLoop::new(config, clock.clone()).unwrap();
        (clock, control)
    }

    fn hot(id: &str) -> ChannelSpec {
        quiet(
            id,
            JointState {
                temperature: 70.0,
                ..JointState::default()
            },
        )
    }

    #[test]
    fn position_near_limit_uses_recovery_law_against_the_position() {
        let position = 0.95 * PI;
        let (_clock, mut control) = build(vec![quiet(
            "knee_left",
            JointState {
                position,
                ..JointState::default()
            },
        )]);

        let report = control.tick();
        assert!(report.reports[0].is_active(AnomalyKind::PositionLimit));
        assert!(!report.reports[0].is_active(AnomalyKind::Overheat));
        let out = &report.outputs[0];
        assert_eq!(out.output.law, ControlLaw::Recovery);
        assert!(out.output.command < 0.0);
        assert!(out.output.command.abs() <= 20.0);
        assert_eq!(out.applied, Some(true));
        // Position limit is handled by the controller, not the monitor.
        assert_eq!(report.safety_state, SafetyState::Normal);
    }

    #[test]
    fn overheat_latches_estop_and_zeroes_the_same_cycle_command() {
        let (_clock, mut control) = build(vec![hot("hip_left"), quiet("knee_left", JointState::default())]);
        let report = control.tick();

        assert!(report.reports[0].is_active(AnomalyKind::Overheat));
        assert!(report.entered_estop);
        assert_eq!(report.safety_state, SafetyState::EmergencyStop);
        assert!(report.issues.iter().any(|i| i.severity == Severity::High));
        for out in &report.outputs {
            assert_eq!(out.output.command, 0.0);
            assert_eq!(out.output.law, ControlLaw::Halted);
        }
        for channel in &report.snapshot.channels {
            assert_eq!(channel.command, 0.0);
        }

        // Stays latched with zero commands on following cycles.
        let report = control.tick();
        assert_eq!(report.safety_state, SafetyState::EmergencyStop);
        assert!(!report.entered_estop);
        assert!(report.outputs.iter().all(|o| o.output.command == 0.0));
        assert_eq!(control.monitor().estop_entries(), 1);
    }

    /// Counts emergency-stop calls; otherwise a perfect joint.
    struct CountingChannel {
        id: String,
        limits: ChannelLimits,
        temperature: f64,
        stops: Arc<AtomicU64>,
    }

    impl HardwareChannel for CountingChannel {
        fn id(&self) -> &str {
            &self.id
        }

        fn limits(&self) -> &ChannelLimits {
            &self.limits
        }

        fn read(&mut self, kind: SignalKind) -> Reading {
            let value = match kind {
                SignalKind::Temperature => self.temperature,
                _ => 0.0,
            };
            Reading {
                timestamp: Duration::ZERO,
                channel: self.id.clone(),
                kind,
                value,
            }
        }

        fn write(&mut self, _command: f64) -> bool {
            true
        }

        fn emergency_stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn measurement_noise(&self, _kind: SignalKind) -> f64 {
            0.0
        }

        fn fault_count(&self) -> u64 {
            0
        }

        fn recent_faults(&self) -> Vec<FaultRecord> {
            Vec::new()
        }
    }

    #[test]
    fn estop_broadcast_reaches_every_channel_exactly_once() {
        let stops: Vec<Arc<AtomicU64>> = (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();
        let mut registry = ChannelRegistry::new();
        for (i, counter) in stops.iter().enumerate() {
            registry.register(Box::new(CountingChannel {
                id: format!("joint_{i}"),
                limits: ChannelLimits::default(),
                temperature: if i == 1 { 80.0 } else { 25.0 },
                stops: Arc::clone(counter),
            }));
        }
        let clock = Arc::new(VirtualClock::new());
        let config = ControlLoopConfig {
            exit_policy: ExitPolicy::KeepReporting,
            ..ControlLoopConfig::default()
        };
        let mut control = ControlLoop::with_registry(config, clock, registry).unwrap();

        for _ in 0..5 {
            control.tick();
        }
        for counter in &stops {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn persistent_overruns_escalate_per_policy() {
        let spec = ChannelSpec {
            faults: FaultInjection {
                base_delay: Duration::from_millis(5),
                noise_std: 0.0,
                error_rate: 0.0,
            },
            ..ChannelSpec::new("hip_left")
        };
        let clock = Arc::new(VirtualClock::new());
        let config = ControlLoopConfig {
            deadline_policy: DeadlinePolicy {
                action: DeadlineAction::Warn,
                consecutive_misses: 2,
            },
            ..ControlLoopConfig::default()
        }
        .with_channels(vec![spec]);
        let mut control = ControlLoop::new(config, clock).unwrap();

        let first = control.tick();
        assert!(!first.missed_deadline);
        let second = control.tick();
        assert!(second.missed_deadline);
        assert_eq!(second.safety_state, SafetyState::Normal);
        let third = control.tick();
        assert!(third.missed_deadline);
        assert!(third.issues.iter().any(|i| i.kind == IssueKind::DeadlineMiss));
        assert_eq!(third.safety_state, SafetyState::Warning);
        assert_eq!(third.snapshot.scheduler.missed_deadlines, 2);
    }

    #[test]
    fn deadline_misses_are_only_counted_by_default() {
        let spec = ChannelSpec {
            faults: FaultInjection {
                base_delay: Duration::from_millis(5),
                noise_std: 0.0,
                error_rate: 0.0,
            },
            ..ChannelSpec::new("hip_left")
        };
        let (_clock, mut control) = build(vec![spec]);
        for _ in 0..30 {
            control.tick();
        }
        assert_eq!(control.scheduler().missed_deadlines(), 29);
        assert_eq!(control.safety_state(), SafetyState::Normal);
    }

    #[test]
    fn zero_latency_loop_never_misses() {
        let (_clock, mut control) = build(vec![quiet("a", JointState::default()), quiet("b", JointState::default())]);
        for _ in 0..200 {
            control.tick();
        }
        assert_eq!(control.scheduler().missed_deadlines(), 0);
        assert_eq!(control.summary().cycles, 200);
    }

    #[test]
    fn pause_skips_writes_but_keeps_sensing() {
        let mut spec = quiet("hip_left", JointState::default());
        spec.target = 0.5;
        let (_clock, mut control) = build(vec![spec]);

        control
            .command_sender()
            .try_send(ControlCommand::Mode(ModeCommand::Pause))
            .unwrap();
        let report = control.tick();
        assert!(control.is_paused());
        assert_eq!(report.outputs[0].applied, None);
        assert_eq!(report.snapshot.channels[0].command, 0.0);
        assert_eq!(
            control.buffer("hip_left", SignalKind::Position).map(|b| b.len()),
            Some(1)
        );

        control
            .command_sender()
            .try_send(ControlCommand::Mode(ModeCommand::Run))
            .unwrap();
        let report = control.tick();
        assert_eq!(report.outputs[0].applied, Some(true));
        assert!(report.outputs[0].output.command > 0.0);
    }

    #[test]
    fn commands_apply_in_order_and_unknown_channels_are_rejected() {
        let (_clock, mut control) = build(vec![quiet("hip_left", JointState::default())]);
        let tx = control.command_sender();
        tx.try_send(ControlCommand::SetTarget {
            channel: "hip_left".into(),
            target_rad: 0.2,
        })
        .unwrap();
        tx.try_send(ControlCommand::SetTarget {
            channel: "elbow".into(),
            target_rad: 0.1,
        })
        .unwrap();
        tx.try_send(ControlCommand::SetTarget {
            channel: "hip_left".into(),
            target_rad: -0.3,
        })
        .unwrap();

        let report = control.tick();
        assert_eq!(control.target("hip_left"), Some(-0.3));
        assert_eq!(report.rejected, vec![ControlError::UnknownChannel("elbow".into())]);
    }

    #[test]
    fn run_and_reset_follow_the_latch() {
        let (_clock, mut control) = build(vec![hot("hip_left")]);
        assert_eq!(
            control.apply_command(ControlCommand::Mode(ModeCommand::ResetAfterEstop)),
            Err(ControlError::ResetRejected(SafetyState::Normal))
        );

        control.tick();
        assert_eq!(
            control.apply_command(ControlCommand::Mode(ModeCommand::Run)),
            Err(ControlError::EmergencyStopLatched)
        );

        let mut events = control.subscribe(Topic::SafetyEvents);
        assert!(control
            .apply_command(ControlCommand::Mode(ModeCommand::ResetAfterEstop))
            .is_ok());
        assert_eq!(control.safety_state(), SafetyState::Normal);
        let (drained, _) = events.drain();
        assert!(matches!(
            drained[0].payload,
            EventPayload::SafetyStateChanged {
                from: SafetyState::EmergencyStop,
                to: SafetyState::Normal,
                ..
            }
        ));

        // Still hot: the next cycle latches again, as a new entry.
        let report = control.tick();
        assert!(report.entered_estop);
        assert_eq!(control.monitor().estop_entries(), 2);
    }

    #[test]
    fn events_cover_issues_transitions_and_telemetry() {
        let (_clock, mut control) = build(vec![hot("hip_left")]);
        let mut safety = control.subscribe(Topic::SafetyEvents);
        let mut telemetry = control.subscribe(Topic::Telemetry);

        control.tick();
        control.tick();

        let (events, dropped) = safety.drain();
        assert_eq!(dropped, 0);
        let issue_events = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::SafetyIssue(_)))
            .count();
        let transitions: Vec<&Event> = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::SafetyStateChanged { .. }))
            .collect();
        // The overheat persists, so one issue per cycle, but only one transition.
        assert_eq!(issue_events, 2);
        assert_eq!(transitions.len(), 1);
        match &transitions[0].payload {
            EventPayload::SafetyStateChanged { from, to, issues } => {
                assert_eq!(*from, SafetyState::Normal);
                assert_eq!(*to, SafetyState::EmergencyStop);
                assert_eq!(issues.len(), 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(transitions[0].source, EVENT_SOURCE);

        let (snapshots, _) = telemetry.drain();
        assert_eq!(snapshots.len(), 2);
        match &snapshots[1].payload {
            EventPayload::Telemetry(snapshot) => {
                assert_eq!(snapshot.scheduler.cycle_count, 2);
                assert_eq!(snapshot.safety_state, SafetyState::EmergencyStop);
                assert_eq!(snapshot.channels[0].anomalies, vec![AnomalyKind::Overheat]);
                assert!((snapshot.channels[0].temperature - 70.0).abs() < 1e-9);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn command_failures_are_reported_without_stopping() {
        let spec = ChannelSpec {
            faults: FaultInjection {
                base_delay: Duration::ZERO,
                noise_std: 0.0,
                error_rate: 1.0,
            },
            target: 0.5,
            ..ChannelSpec::new("ankle_left")
        };
        let (_clock, mut control) = build(vec![spec]);
        for _ in 0..3 {
            let report = control.tick();
            assert_eq!(report.outputs[0].applied, Some(false));
            let failure = report
                .issues
                .iter()
                .find(|i| i.kind == IssueKind::CommandFailure)
                .unwrap();
            assert_eq!(failure.severity, Severity::Medium);
            assert_eq!(report.safety_state, SafetyState::Normal);
        }
        assert!(control.summary().fault_counts[0].1 > 0);
    }

    #[test]
    fn run_exits_after_one_full_emergency_cycle() {
        let (_clock, mut control) = build(vec![hot("hip_left")]);
        let stop = AtomicBool::new(false);
        let summary = control.run(&stop);
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.final_state, SafetyState::EmergencyStop);
        assert_eq!(summary.estop_entries, 1);
        assert_eq!(summary.fault_counts, vec![("hip_left".to_string(), 0)]);
    }

    #[test]
    fn run_honours_a_raised_stop_signal() {
        let (_clock, mut control) = build(vec![quiet("hip_left", JointState::default())]);
        let stop = AtomicBool::new(true);
        let summary = control.run(&stop);
        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.final_state, SafetyState::Normal);
    }

    #[test]
    fn buffers_are_bounded_by_configured_capacity() {
        let clock = Arc::new(VirtualClock::new());
        let config = ControlLoopConfig {
            buffer_capacity: 3,
            ..ControlLoopConfig::default()
        }
        .with_channels(vec![quiet("hip_left", JointState::default())]);
        let mut control = ControlLoop::new(config, clock).unwrap();
        for _ in 0..5 {
            control.tick();
        }
        let buffer = control.buffer("hip_left", SignalKind::Position).unwrap();
        assert_eq!(buffer.len(), 3);
        let stamps: Vec<Duration> = buffer.recent(3).iter().map(|r| r.timestamp).collect();
        assert_eq!(
            stamps,
            vec![Duration::from_millis(6), Duration::from_millis(8), Duration::from_millis(10)]
        );
    }

    #[test]
    fn parallel_io_matches_sequential_io() {
        let specs = |parallel: bool| {
            let config = ControlLoopConfig {
                parallel_io: parallel,
                ..ControlLoopConfig::default()
            };
            let channels = config
                .channels
                .iter()
                .map(|c| ChannelSpec {
                    faults: FaultInjection {
                        base_delay: Duration::ZERO,
                        noise_std: 0.01,
                        error_rate: 0.0,
                    },
                    target: 0.3,
                    ..c.clone()
                })
                .collect();
            config.with_channels(channels)
        };

        let mut sequential = ControlLoop::new(specs(false), Arc::new(VirtualClock::new())).unwrap();
        let mut parallel = ControlLoop::new(specs(true), Arc::new(VirtualClock::new())).unwrap();
        for _ in 0..20 {
            let a = sequential.tick();
            let b = parallel.tick();
            for (x, y) in a.snapshot.channels.iter().zip(&b.snapshot.channels) {
                assert_eq!(x.channel, y.channel);
                assert_eq!(x.position, y.position);
                assert_eq!(x.command, y.command);
            }
        }
    }

    /// A joint whose driver panics on read or on write.
    struct PanickingChannel {
        id: String,
        limits: ChannelLimits,
        panic_on_read: bool,
    }

    impl HardwareChannel for PanickingChannel {
        fn id(&self) -> &str {
            &self.id
        }

        fn limits(&self) -> &ChannelLimits {
            &self.limits
        }

        fn read(&mut self, kind: SignalKind) -> Reading {
            if self.panic_on_read {
                panic!("encoder bus lost");
            }
            Reading {
                timestamp: Duration::ZERO,
                channel: self.id.clone(),
                kind,
                value: if kind == SignalKind::Temperature { 25.0 } else { 0.0 },
            }
        }

        fn write(&mut self, _command: f64) -> bool {
            panic!("amplifier bus lost");
        }

        fn emergency_stop(&mut self) {}

        fn measurement_noise(&self, _kind: SignalKind) -> f64 {
            0.0
        }

        fn fault_count(&self) -> u64 {
            0
        }

        fn recent_faults(&self) -> Vec<FaultRecord> {
            Vec::new()
        }
    }

    fn panicking_loop(parallel: bool, panic_on_read: bool) -> ControlLoop {
        let mut registry = ChannelRegistry::new();
        for i in 0..2 {
            registry.register(Box::new(PanickingChannel {
                id: format!("joint_{i}"),
                limits: ChannelLimits::default(),
                panic_on_read,
            }));
        }
        let config = ControlLoopConfig {
            parallel_io: parallel,
            ..ControlLoopConfig::default()
        };
        ControlLoop::with_registry(config, Arc::new(VirtualClock::new()), registry).unwrap()
    }

    fn panic_message(mut control: ControlLoop) -> String {
        let payload = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            control.tick();
        }))
        .expect_err("tick must not complete");
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default()
    }

    #[test]
    fn channel_panic_surfaces_the_same_in_both_io_modes() {
        for parallel in [false, true] {
            assert_eq!(panic_message(panicking_loop(parallel, true)), "encoder bus lost");
            assert_eq!(panic_message(panicking_loop(parallel, false)), "amplifier bus lost");
        }
    }

    #[test]
    fn each_tick_runs_in_a_span_carrying_its_cycle() {
        use std::sync::Mutex;

        use tracing::span::{Attributes, Id};
        use tracing::Subscriber;
        use tracing_subscriber::layer::{Context, SubscriberExt};
        use tracing_subscriber::{Layer, Registry};

        #[derive(Clone, Default)]
        struct SpanLog(Arc<Mutex<Vec<(String, bool)>>>);

        impl<S: Subscriber> Layer<S> for SpanLog {
            fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
                let meta = attrs.metadata();
                let has_cycle = meta.fields().field("cycle").is_some();
                self.0.lock().unwrap().push((meta.name().to_string(), has_cycle));
            }
        }

        let log = SpanLog::default();
        let subscriber = Registry::default().with(log.clone());
        let mut control =
            ControlLoop::new(ControlLoopConfig::default(), Arc::new(VirtualClock::new())).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            control.tick();
            control.tick();
        });

        let spans = log.0.lock().unwrap();
        let ticks: Vec<_> = spans.iter().filter(|(name, _)| name == "tick").collect();
        assert_eq!(ticks.len(), 2);
        assert!(ticks.iter().all(|(_, has_cycle)| *has_cycle));
    }
}
