//! Interval loop for `syncbus loop`.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::types::StopSignal;
use crate::cycle::{Collaborators, CycleSummary, SyncBus, run_cycle};
use crate::error::CycleError;
use crate::io::control::ControlFlags;

/// Longest uninterrupted sleep between stop-flag checks.
pub const MAX_POLL_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Time between the start of one cycle and the start of the next.
    pub interval: Duration,
    /// Stop after this many cycles (successful or not).
    pub max_cycles: Option<u32>,
    pub poll_tick: Duration,
}

impl LoopConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_cycles: None,
            poll_tick: MAX_POLL_TICK,
        }
    }

    pub fn with_max_cycles(mut self, max_cycles: Option<u32>) -> Self {
        self.max_cycles = max_cycles;
        self
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The stop flag was raised.
    SoftStop,
    /// `max_cycles` cycles ran.
    MaxCycles,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub cycles_run: u32,
    /// Cycles that ended in a [`CycleError`] (including `AlreadyBusy`).
    pub failures: u32,
    pub stop: LoopStop,
}

/// Run cycles every `cfg.interval` until the stop flag is raised or
/// `max_cycles` is reached.
///
/// A failed cycle is reported to `on_cycle` and the loop carries on; only a
/// stop flag that cannot be read ends the loop with an error. The flag is
/// checked before every cycle and while waiting, never mid-cycle, and it is
/// left in place for the caller to clear.
pub fn run_loop<F>(
    bus: &SyncBus,
    collab: &Collaborators<'_>,
    control: &dyn ControlFlags,
    cfg: &LoopConfig,
    mut on_cycle: F,
) -> Result<LoopOutcome>
where
    F: FnMut(&Result<CycleSummary, CycleError>),
{
    let mut cycles_run = 0u32;
    let mut failures = 0u32;
    loop {
        if control.stop_signal()? == StopSignal::SoftStop {
            return Ok(finish(cycles_run, failures, LoopStop::SoftStop));
        }
        if cfg.max_cycles.is_some_and(|max| cycles_run >= max) {
            return Ok(finish(cycles_run, failures, LoopStop::MaxCycles));
        }

        let started = Instant::now();
        let result = run_cycle(bus, collab);
        cycles_run += 1;
        if let Err(err) = &result {
            failures += 1;
            warn!(cycle = cycles_run, err = %err, "cycle failed, continuing");
        }
        on_cycle(&result);

        if cfg.max_cycles.is_some_and(|max| cycles_run >= max) {
            return Ok(finish(cycles_run, failures, LoopStop::MaxCycles));
        }
        if wait_for_next(control, cfg, started)? == StopSignal::SoftStop {
            return Ok(finish(cycles_run, failures, LoopStop::SoftStop));
        }
    }
}

fn finish(cycles_run: u32, failures: u32, stop: LoopStop) -> LoopOutcome {
    info!(cycles_run, failures, ?stop, "loop stopped");
    LoopOutcome {
        cycles_run,
        failures,
        stop,
    }
}

/// Sleep until `interval` has passed since `started`, waking every
/// `poll_tick` to look at the stop flag.
fn wait_for_next(
    control: &dyn ControlFlags,
    cfg: &LoopConfig,
    started: Instant,
) -> Result<StopSignal> {
    let floor = Duration::from_millis(1);
    let tick = cfg.poll_tick.min(MAX_POLL_TICK).max(floor);
    loop {
        if control.stop_signal()? == StopSignal::SoftStop {
            debug!("stop flag seen while waiting");
            return Ok(StopSignal::SoftStop);
        }
        let remaining = cfg.interval.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(StopSignal::Clear);
        }
        thread::sleep(remaining.min(tick));
    }
}
