//! [`FixedRateScheduler`] – fixed-period cycle timing.
//!
//! Each call to [`FixedRateScheduler::wait_for_next_cycle`] advances the
//! deadline by one period.  If the deadline is still ahead the scheduler
//! sleeps until it; if it has already passed, the cycle counts as a missed
//! deadline, fires immediately, and the next deadline is re-anchored to
//! `now + period`.  Missed cycles are dropped, never queued, so the
//! schedule cannot fall permanently behind.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rtjoint_hal::clock::{Clock, VirtualClock};
//! use rtjoint_runtime::scheduler::FixedRateScheduler;
//!
//! let clock = Arc::new(VirtualClock::new());
//! let mut sched = FixedRateScheduler::new(clock.clone(), 500.0).unwrap();
//!
//! let tick = sched.wait_for_next_cycle();
//! assert_eq!(tick.fired_at, Duration::from_millis(2));
//! assert!(!tick.missed);
//!
//! clock.advance(Duration::from_millis(5)); // overrun
//! let tick = sched.wait_for_next_cycle();
//! assert!(tick.missed);
//! assert_eq!(sched.next_deadline(), Duration::from_millis(9));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rtjoint_hal::clock::Clock;
use rtjoint_types::{ControlError, SchedulerStats};
use serde::Serialize;
use tracing::warn;

/// Number of fire times kept for jitter diagnostics.
pub const HISTORY_LEN: usize = 100;

/// One scheduler firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based cycle number.
    pub cycle: u64,
    pub fired_at: Duration,
    /// The deadline had already passed when the cycle was requested.
    pub missed: bool,
}

/// Period statistics over the fire-time history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct JitterStats {
    /// Number of intervals measured.
    pub samples: usize,
    pub mean_period: Duration,
    /// Largest distance between a measured interval and the nominal period.
    pub max_deviation: Duration,
}

pub struct FixedRateScheduler {
    clock: Arc<dyn Clock>,
    period: Duration,
    next_deadline: Duration,
    cycle_count: u64,
    missed_deadlines: u64,
    history: VecDeque<Duration>,
}

impl FixedRateScheduler {
    /// Scheduler at `frequency_hz`, anchored at the clock's current time.
    pub fn new(clock: Arc<dyn Clock>, frequency_hz: f64) -> Result<Self, ControlError> {
        if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
            return Err(ControlError::InvalidConfig(format!(
                "frequency_hz {frequency_hz} must be positive"
            )));
        }
        let period = Duration::try_from_secs_f64(1.0 / frequency_hz)
            .map_err(|e| ControlError::InvalidConfig(format!("frequency_hz {frequency_hz}: {e}")))?;
        Self::with_period(clock, period)
    }

    pub fn with_period(clock: Arc<dyn Clock>, period: Duration) -> Result<Self, ControlError> {
        if period.is_zero() {
            return Err(ControlError::InvalidConfig("period must be non-zero".into()));
        }
        let next_deadline = clock.now();
        Ok(Self {
            clock,
            period,
            next_deadline,
            cycle_count: 0,
            missed_deadlines: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// The deadline the next cycle will be scheduled against, before the
    /// period is added.
    pub fn next_deadline(&self) -> Duration {
        self.next_deadline
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn missed_deadlines(&self) -> u64 {
        self.missed_deadlines
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            cycle_count: self.cycle_count,
            missed_deadlines: self.missed_deadlines,
        }
    }

    /// Recent fire times, oldest first.
    pub fn history(&self) -> impl Iterator<Item = Duration> + '_ {
        self.history.iter().copied()
    }

    /// Block until the next cycle is due.
    pub fn wait_for_next_cycle(&mut self) -> Tick {
        let now = self.clock.now();
        self.next_deadline += self.period;

        let missed = now >= self.next_deadline;
        if missed {
            self.missed_deadlines += 1;
            warn!(
                cycle = self.cycle_count + 1,
                overrun_us = (now - self.next_deadline).as_micros() as u64,
                "missed deadline"
            );
            self.next_deadline = now + self.period;
        } else {
            self.clock.sleep_until(self.next_deadline);
        }

        let fired_at = self.clock.now();
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(fired_at);
        self.cycle_count += 1;

        Tick {
            cycle: self.cycle_count,
            fired_at,
            missed,
        }
    }

    /// Interval statistics over the retained fire times.
    pub fn jitter(&self) -> JitterStats {
        let samples = self.history.len().saturating_sub(1);
        if samples == 0 {
            return JitterStats::default();
        }
        let mut total = Duration::ZERO;
        let mut max_deviation = Duration::ZERO;
        for (a, b) in self.history.iter().zip(self.history.iter().skip(1)) {
            let interval = b.saturating_sub(*a);
            total += interval;
            let deviation = if interval > self.period {
                interval - self.period
            } else {
                self.period - interval
            };
            max_deviation = max_deviation.max(deviation);
        }
        JitterStats {
            samples,
            mean_period: total / samples as u32,
            max_deviation,
        }
    }
}
