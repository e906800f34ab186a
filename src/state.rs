//! Persisted supervisor history: start time, accumulated uptime, recent crashes.

use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of crash entries retained in the state file.
pub const MAX_CRASH_ENTRIES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorState {
    #[serde(default)]
    pub last_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_uptime_seconds: f64,
    /// Oldest first.
    #[serde(default)]
    pub crashes: VecDeque<CrashEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashEntry {
    pub timestamp: DateTime<Utc>,
    pub exit_code: i32,
    pub uptime_at_crash: Option<String>,
}

impl SupervisorState {
    pub fn record_start(&mut self, at: DateTime<Utc>) {
        if let Some(previous) = self.last_start {
            tracing::warn!(
                previous = %previous.to_rfc3339(),
                "previous run never recorded an exit; discarding its start time"
            );
        }
        self.last_start = Some(at);
    }

    /// Folds the current run into the accumulated uptime. Returns the length
    /// of the run that just ended, if one was open.
    pub fn record_stop(&mut self, at: DateTime<Utc>) -> Option<f64> {
        let started = self.last_start.take()?;
        let run_seconds = seconds_between(started, at);
        self.total_uptime_seconds += run_seconds;
        Some(run_seconds)
    }

    pub fn record_crash(&mut self, at: DateTime<Utc>, exit_code: i32) -> CrashEntry {
        let uptime_at_crash = self
            .last_start
            .take()
            .map(|started| format_uptime(seconds_between(started, at)));
        let entry = CrashEntry {
            timestamp: at,
            exit_code,
            uptime_at_crash,
        };
        self.crashes.push_back(entry.clone());
        while self.crashes.len() > MAX_CRASH_ENTRIES {
            self.crashes.pop_front();
        }
        entry
    }

    pub fn current_uptime_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_start.map(|started| seconds_between(started, now))
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// Renders a duration as e.g. `2d 3h 04m 05s`, dropping leading zero units.
pub fn format_uptime(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let secs = total % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes:02}m {secs:02}s")
    } else if hours > 0 {
        format!("{hours}h {minutes:02}m {secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Whole-file JSON persistence for [`SupervisorState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh history.
    pub fn load(&self) -> Result<SupervisorState, StateError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(SupervisorState::default());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(SupervisorState::default());
        }
        serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes to a sibling temp file and renames it into place.
    pub fn save(&self, state: &SupervisorState) -> Result<(), StateError> {
        let io_error = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }
        let contents = serde_json::to_vec_pretty(state)
            .map_err(|err| io_error(io::Error::new(io::ErrorKind::Other, err)))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, contents).map_err(io_error)?;
        fs::rename(&tmp_path, &self.path).map_err(io_error)?;
        Ok(())
    }
}
