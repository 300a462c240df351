use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Nothing evaluated yet.
    #[default]
    Unloaded,
    /// Source evaluated, but the logic never registered an app.
    Loaded,
    /// The app registered and `onLaunch` ran.
    Launched,
    /// The sandbox has handled at least one call after launch.
    Running,
    /// Disposed; timers cancelled and no further calls accepted.
    Disposed,
}

impl SandboxState {
    /// Wire name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Launched => "launched",
            Self::Running => "running",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State observable from outside the sandbox thread.
#[derive(Debug)]
pub(crate) struct SharedStatus {
    state: Mutex<SandboxState>,
    snapshot: Mutex<Arc<Value>>,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            state: Mutex::new(SandboxState::Unloaded),
            snapshot: Mutex::new(Arc::new(Value::Object(Map::new()))),
        }
    }
}

impl SharedStatus {
    pub(crate) fn state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: SandboxState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// `Launched → Running`; every other state is left alone.
    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SandboxState::Launched {
            *state = SandboxState::Running;
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.snapshot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn set_snapshot(&self, snapshot: Arc<Value>) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}
