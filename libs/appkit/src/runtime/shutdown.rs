use std::time::{Duration, Instant};

use crate::events::BusStopOutcome;
use crate::registry::StopReport;

/// Overall teardown budget; each step gets its own limit clamped to what is left.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
}

impl Deadline {
    pub(crate) fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub(crate) fn clamp(&self, step: Duration) -> Duration {
        step.min(self.remaining())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    TimedOut(Duration),
    Failed(String),
    Skipped,
}

impl StepOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// What happened during teardown. Failures are recorded, never propagated.
#[derive(Debug)]
pub struct ShutdownReport {
    pub http: StepOutcome,
    pub modules: StepOutcome,
    /// Per-module stop results; a hook that ran out of time appears as an error.
    pub module_report: StopReport,
    pub event_bus: BusStopOutcome,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// True when every step finished in time and no module failed to stop.
    pub fn is_clean(&self) -> bool {
        self.http.is_completed()
            && self.modules.is_completed()
            && self.module_report.is_clean()
            && matches!(
                self.event_bus,
                BusStopOutcome::Drained | BusStopOutcome::NeverStarted { .. }
            )
    }
}
