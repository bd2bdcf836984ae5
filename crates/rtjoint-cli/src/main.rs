//! `rtjoint-cli` – command line front end for the joint control loop
//!
//! ```text
//! rtjoint [CONFIG]        run the loop (config from CONFIG or $RTJOINT_CONFIG)
//! rtjoint init <PATH>     write the default configuration to PATH
//! ```
//!
//! The binary:
//!
//! 1. Loads the TOML configuration and applies `RTJOINT_*` overrides, falling
//!    back to the six-joint default demo when the file is missing or broken.
//! 2. Runs the [`ControlLoop`] on the system clock in a blocking task.
//! 3. Prints safety events as they arrive, plus a telemetry line every
//!    `run.telemetry_every` cycles.
//! 4. Stops on **Ctrl-C**, after `run.duration_secs`, or when the exit policy
//!    ends the run, and prints a summary.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use rtjoint_hal::clock::SystemClock;
use rtjoint_middleware::{EventReceiver, Topic};
use rtjoint_runtime::{ControlLoop, RunSummary, init_tracing};
use rtjoint_types::{Event, EventPayload, SafetyState, Severity};
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("init") {
        std::process::exit(run_init(args.get(1).map(String::as_str)));
    }

    // Held until exit so pending spans are flushed.
    let _telemetry = init_tracing("rtjoint");

    print_banner();

    let path = config::resolve_path(args.first().map(String::as_str));
    let cfg = match config::load(path.as_deref()) {
        Ok(cfg) => {
            match &path {
                Some(p) if p.exists() => {
                    println!("  Config loaded from {}", p.display().to_string().bold())
                }
                Some(p) => println!(
                    "  {} not found; using the default configuration.",
                    p.display().to_string().bold()
                ),
                None => println!("  No config file given; using the default configuration."),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let mut control = match ControlLoop::new(cfg.control.clone(), Arc::new(SystemClock::new())) {
        Ok(control) => control,
        Err(e) => {
            error!(error = %e, "invalid control loop configuration");
            println!("{}: {}", "Invalid configuration".red().bold(), e);
            std::process::exit(2);
        }
    };

    println!(
        "  {} channel(s) at {} Hz, seed {}",
        control.registry().len(),
        cfg.control.frequency_hz,
        cfg.control.seed
    );
    println!();

    // ── Stop signal ───────────────────────────────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));

    let stop_ctrlc = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping control loop …".yellow().bold());
        stop_ctrlc.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the loop can only stop on its own");
    }

    if let Some(secs) = cfg.run.duration_secs {
        match Duration::try_from_secs_f64(secs) {
            Ok(duration) => {
                let stop_timer = stop.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    stop_timer.store(true, Ordering::SeqCst);
                });
            }
            Err(e) => warn!(duration_secs = secs, error = %e, "ignoring invalid run duration"),
        }
    }

    // ── Outbound queues ───────────────────────────────────────────────────
    let safety = tokio::spawn(print_safety_events(control.subscribe(Topic::SafetyEvents)));
    let telemetry = tokio::spawn(print_telemetry(
        control.subscribe(Topic::Telemetry),
        cfg.run.telemetry_every,
    ));

    // ── Control loop ──────────────────────────────────────────────────────
    // The loop (and with it the event bus) is dropped when the blocking task
    // returns, which closes both printers.
    let stop_loop = stop.clone();
    let summary = tokio::task::spawn_blocking(move || control.run(&stop_loop)).await;

    let _ = safety.await;
    let _ = telemetry.await;

    match summary {
        Ok(summary) => {
            print_summary(&summary);
            if summary.final_state == SafetyState::EmergencyStop {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!(error = %e, "control loop task failed");
            std::process::exit(1);
        }
    }
}

/// `rtjoint init <path>`: write the default configuration.
fn run_init(path: Option<&str>) -> i32 {
    let Some(path) = path else {
        println!("usage: rtjoint init <PATH>");
        return 2;
    };
    let path = PathBuf::from(path);
    if path.exists() {
        println!(
            "{}: {} already exists",
            "Refusing to overwrite".red(),
            path.display()
        );
        return 1;
    }
    match config::save_to(&config::Config::default(), &path) {
        Ok(()) => {
            println!(
                "  {} Config saved to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            0
        }
        Err(e) => {
            println!("{}: {}", "Error saving config".red(), e);
            1
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event printers
// ─────────────────────────────────────────────────────────────────────────────

async fn print_safety_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        if let Some(line) = format_safety_event(&event) {
            println!("{line}");
        }
    }
}

async fn print_telemetry(mut rx: EventReceiver, every: u64) {
    while let Some(event) = rx.recv().await {
        if every == 0 || event.cycle % every != 0 {
            continue;
        }
        if let Some(line) = format_telemetry(&event) {
            println!("{line}");
        }
    }
}

fn format_safety_event(event: &Event) -> Option<String> {
    match &event.payload {
        EventPayload::SafetyIssue(issue) => {
            let tag = match issue.severity {
                Severity::High => "HIGH".red().bold(),
                Severity::Medium => "MEDIUM".yellow(),
            };
            Some(format!(
                "  [{:>7}] {} {} {}: {}",
                event.cycle,
                tag,
                issue.channel.bold(),
                issue.kind,
                issue.message
            ))
        }
        EventPayload::SafetyStateChanged { from, to, issues } => {
            let to_label = match to {
                SafetyState::Normal => to.to_string().green().bold(),
                SafetyState::Warning => to.to_string().yellow().bold(),
                SafetyState::EmergencyStop => to.to_string().red().bold(),
            };
            Some(format!(
                "  [{:>7}] safety state {} → {} ({} issue(s))",
                event.cycle,
                from,
                to_label,
                issues.len()
            ))
        }
        EventPayload::Telemetry(_) => None,
    }
}

fn format_telemetry(event: &Event) -> Option<String> {
    let EventPayload::Telemetry(snapshot) = &event.payload else {
        return None;
    };
    let joints: Vec<String> = snapshot
        .channels
        .iter()
        .map(|c| format!("{}={:+.3}", c.channel, c.position))
        .collect();
    Some(format!(
        "  [{:>7}] {} missed={} {}",
        snapshot.scheduler.cycle_count,
        snapshot.safety_state,
        snapshot.scheduler.missed_deadlines,
        joints.join(" ").dimmed()
    ))
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "  Run summary".bold().cyan());
    println!("    cycles            {}", summary.cycles);
    println!("    missed deadlines  {}", summary.missed_deadlines);
    println!("    estop entries     {}", summary.estop_entries);
    let state = match summary.final_state {
        SafetyState::Normal => summary.final_state.to_string().green(),
        SafetyState::Warning => summary.final_state.to_string().yellow(),
        SafetyState::EmergencyStop => summary.final_state.to_string().red(),
    };
    println!("    final state       {}", state.bold());
    println!(
        "    mean period       {:?} (max deviation {:?} over {} samples)",
        summary.jitter.mean_period, summary.jitter.max_deviation, summary.jitter.samples
    );
    for (channel, faults) in &summary.fault_counts {
        println!("    faults {:<12} {}", channel, faults);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}",
        "rtjoint".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Real-time joint control loop");
    println!();
}

#[cfg(test)]
mod tests {
    use rtjoint_types::{
        AnomalyKind, ChannelTelemetry, IssueKind, SafetyIssue, SchedulerStats, TelemetrySnapshot,
    };

    use super::*;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn safety_issue_line_names_channel_and_message() {
        plain();
        let event = Event::new(
            "test",
            12,
            EventPayload::SafetyIssue(SafetyIssue {
                channel: "hip_left".into(),
                kind: IssueKind::Anomaly(AnomalyKind::Overheat),
                severity: Severity::High,
                message: "Overheating: 70.0°C".into(),
            }),
        );
        let line = format_safety_event(&event).expect("line");
        assert!(line.contains("HIGH"), "{line}");
        assert!(line.contains("hip_left"), "{line}");
        assert!(line.contains("Overheating: 70.0°C"), "{line}");
    }

    #[test]
    fn state_change_line_shows_both_states() {
        plain();
        let event = Event::new(
            "test",
            3,
            EventPayload::SafetyStateChanged {
                from: SafetyState::Normal,
                to: SafetyState::EmergencyStop,
                issues: Vec::new(),
            },
        );
        let line = format_safety_event(&event).expect("line");
        assert!(line.contains(&SafetyState::Normal.to_string()), "{line}");
        assert!(line.contains(&SafetyState::EmergencyStop.to_string()), "{line}");
    }

    #[test]
    fn telemetry_line_lists_joint_positions() {
        plain();
        let snapshot = TelemetrySnapshot {
            timestamp: Duration::from_millis(500),
            channels: vec![ChannelTelemetry {
                channel: "knee_left".into(),
                position: 0.2,
                velocity: 0.0,
                torque: 0.0,
                temperature: 25.0,
                estimate: 0.2,
                command: 0.0,
                anomalies: Vec::new(),
            }],
            safety_state: SafetyState::Normal,
            scheduler: SchedulerStats {
                cycle_count: 250,
                missed_deadlines: 1,
            },
        };
        let event = Event::new("test", 250, EventPayload::Telemetry(snapshot));
        let line = format_telemetry(&event).expect("line");
        assert!(line.contains("knee_left=+0.200"), "{line}");
        assert!(line.contains("missed=1"), "{line}");
        assert!(format_safety_event(&event).is_none());
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("rtjoint.toml");
        let path_str = path.to_string_lossy().to_string();

        assert_eq!(run_init(Some(&path_str)), 0);
        assert!(path.exists());
        assert_eq!(run_init(Some(&path_str)), 1);
        assert_eq!(run_init(None), 2);
    }
}
