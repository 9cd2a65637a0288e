use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use super::BootstrapError;

/// Application lifecycle phases, in the only order they may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    CoreServicesReady,
    ModulesInitialized,
    SchemaSynced,
    ContractsRegistered,
    Seeded,
    EventBusStarted,
    ModulesStarted,
    Serving,
    Stopping,
    Stopped,
}

impl Phase {
    pub const fn next(self) -> Option<Phase> {
        use Phase::*;
        match self {
            Uninitialized => Some(CoreServicesReady),
            CoreServicesReady => Some(ModulesInitialized),
            ModulesInitialized => Some(SchemaSynced),
            SchemaSynced => Some(ContractsRegistered),
            ContractsRegistered => Some(Seeded),
            Seeded => Some(EventBusStarted),
            EventBusStarted => Some(ModulesStarted),
            ModulesStarted => Some(Serving),
            Serving => Some(Stopping),
            Stopping => Some(Stopped),
            Stopped => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        use Phase::*;
        match self {
            Uninitialized => "uninitialized",
            CoreServicesReady => "core_services_ready",
            ModulesInitialized => "modules_initialized",
            SchemaSynced => "schema_synced",
            ContractsRegistered => "contracts_registered",
            Seeded => "seeded",
            EventBusStarted => "event_bus_started",
            ModulesStarted => "modules_started",
            Serving => "serving",
            Stopping => "stopping",
            Stopped => "stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase plus the history of completed transitions.
#[derive(Debug)]
pub struct PhaseTracker {
    inner: Mutex<Vec<(Phase, Instant)>>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(vec![(Phase::Uninitialized, Instant::now())]),
        }
    }

    pub fn current(&self) -> Phase {
        self.inner
            .lock()
            .last()
            .map_or(Phase::Uninitialized, |(p, _)| *p)
    }

    /// Moves to `to` if it is the immediate successor of the current phase.
    pub fn advance(&self, to: Phase) -> Result<(), BootstrapError> {
        let mut history = self.inner.lock();
        let from = history.last().map_or(Phase::Uninitialized, |(p, _)| *p);
        if from.next() != Some(to) {
            return Err(BootstrapError::InvalidTransition { from, to });
        }
        let elapsed_ms = history
            .last()
            .map_or(0, |(_, at)| at.elapsed().as_millis() as u64);
        history.push((to, Instant::now()));
        drop(history);

        tracing::info!(phase = %to, previous = %from, elapsed_ms, "Phase: {to}");
        Ok(())
    }

    /// Every phase entered so far, starting with `Uninitialized`.
    pub fn history(&self) -> Vec<Phase> {
        self.inner.lock().iter().map(|(p, _)| *p).collect()
    }
}
