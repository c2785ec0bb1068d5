//! Run state storage and the busy/idle tracker (`logs/state.json`).
//!
//! BUSY is the engine's only mutual-exclusion primitive. It is advisory: two
//! processes racing through [`RunStateTracker::acquire`] can both succeed,
//! which is why every artifact write is atomic on its own.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::run_status::{RunStatus, StaleRecovery, is_stale};
use crate::error::CycleError;
use crate::io::atomic::write_atomic;

/// Persisted busy/idle bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Process holding BUSY.
    pub pid: Option<u32>,
    /// Error that ended the previous cycle, cleared by the next clean one.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Most recent stale-busy recovery, kept so `status` can surface it.
    #[serde(default)]
    pub last_recovery: Option<StaleRecovery>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            current_step: None,
            updated_at: DateTime::<Utc>::default(),
            pid: None,
            last_error: None,
            last_recovery: None,
        }
    }
}

impl RunState {
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        is_stale(self.status, self.updated_at, now, threshold)
    }
}

/// Load run state from disk. A missing file reads as the default IDLE state.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(RunState::default()),
        Err(err) => return Err(err).with_context(|| format!("read run state {}", path.display())),
    };
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(status = state.status.as_str(), step = ?state.current_step, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(
        path = %path.display(),
        status = state.status.as_str(),
        step = ?state.current_step,
        "writing run state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Where run state lives. Tests swap in an in-memory store.
pub trait RunStateStore {
    fn load(&self) -> Result<RunState>;
    fn store(&self, state: &RunState) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileRunStateStore {
    path: PathBuf,
}

impl FileRunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RunStateStore for FileRunStateStore {
    fn load(&self) -> Result<RunState> {
        load_run_state(&self.path)
    }

    fn store(&self, state: &RunState) -> Result<()> {
        write_run_state(&self.path, state)
    }
}

/// Busy/idle transitions over a [`RunStateStore`].
///
/// Every transition is a read-modify-write so fields owned by other
/// transitions (`last_error`, `last_recovery`) are carried forward.
pub struct RunStateTracker<'a> {
    store: &'a dyn RunStateStore,
    stale_after: Duration,
}

impl<'a> RunStateTracker<'a> {
    pub fn new(store: &'a dyn RunStateStore, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub fn read_state(&self) -> Result<RunState> {
        self.store.load()
    }

    /// Clear a BUSY state abandoned by a crashed run.
    pub fn recover_if_stale(&self) -> Result<Option<StaleRecovery>> {
        let now = Utc::now();
        let state = self.store.load()?;
        if !state.is_stale(now, self.stale_after) {
            return Ok(None);
        }
        let recovery = StaleRecovery {
            recovered_at: now,
            stale_since: state.updated_at,
            step: state.current_step.clone(),
            pid: state.pid,
        };
        warn!(
            stale_since = %recovery.stale_since,
            step = ?recovery.step,
            pid = ?recovery.pid,
            "clearing stale BUSY state left by a crashed run"
        );
        self.store.store(&RunState {
            status: RunStatus::Idle,
            current_step: None,
            updated_at: now,
            pid: None,
            last_error: state.last_error,
            last_recovery: Some(recovery.clone()),
        })?;
        Ok(Some(recovery))
    }

    /// Recover a stale state if needed, then take BUSY.
    ///
    /// A fresh BUSY state yields [`CycleError::AlreadyBusy`] and writes
    /// nothing.
    pub fn acquire(&self) -> Result<Option<StaleRecovery>, CycleError> {
        let recovery = self
            .recover_if_stale()
            .map_err(CycleError::StateUnavailable)?;
        let state = self.store.load().map_err(CycleError::StateUnavailable)?;
        if state.status == RunStatus::Busy {
            return Err(CycleError::AlreadyBusy {
                step: state.current_step,
                since: state.updated_at,
            });
        }
        self.mark_busy().map_err(CycleError::StateUnavailable)?;
        Ok(recovery)
    }

    pub fn mark_busy(&self) -> Result<()> {
        self.update(|state| {
            state.status = RunStatus::Busy;
            state.current_step = None;
            state.pid = Some(process::id());
        })
    }

    /// Record the step about to run. Also refreshes `updated_at`, which keeps
    /// a long cycle from looking stale.
    pub fn begin_step(&self, name: &str) -> Result<()> {
        self.update(|state| state.current_step = Some(name.to_string()))
    }

    pub fn end_step(&self) -> Result<()> {
        self.update(|state| state.current_step = None)
    }

    /// Back to IDLE after a clean cycle.
    pub fn mark_idle(&self) -> Result<()> {
        self.finish(None)
    }

    /// Back to IDLE after an aborted cycle, remembering why.
    pub fn mark_failed(&self, error: &str) -> Result<()> {
        self.finish(Some(error.to_string()))
    }

    fn finish(&self, last_error: Option<String>) -> Result<()> {
        self.update(|state| {
            state.status = RunStatus::Idle;
            state.current_step = None;
            state.pid = None;
            state.last_error = last_error;
        })
    }

    fn update(&self, apply: impl FnOnce(&mut RunState)) -> Result<()> {
        let mut state = self.store.load()?;
        apply(&mut state);
        state.updated_at = Utc::now();
        self.store.store(&state)
    }
}
