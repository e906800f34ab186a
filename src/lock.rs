//! Named, PID-tagged advisory lock backed by a file.
//!
//! The OS-level exclusive lock is authoritative for [`AdvisoryLock::acquire`].
//! The JSON record written inside the file is informational: it lets status
//! queries report who holds the lock without taking it.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    process,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_SUBJECT_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_pid: u32,
    pub started_at: DateTime<Utc>,
    pub subject: String,
}

impl LockRecord {
    fn for_current_process(subject: &str) -> Self {
        Self {
            holder_pid: process::id(),
            started_at: Utc::now(),
            subject: subject.chars().take(MAX_SUBJECT_CHARS).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("InProgress: {}", describe_holder(.0.as_ref()))]
    InProgress(Option<LockRecord>),
    #[error("lock file '{path}' is not usable: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn describe_holder(record: Option<&LockRecord>) -> String {
    match record {
        Some(record) => format!(
            "already held by pid {} since {} for '{}'",
            record.holder_pid,
            record.started_at.to_rfc3339(),
            record.subject
        ),
        None => "already held by another process".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub in_progress: bool,
    /// The record was found but its holder is no longer running.
    pub stale: bool,
    pub record: Option<LockRecord>,
}

#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    path: PathBuf,
}

impl AdvisoryLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Attempts a non-blocking exclusive lock. Contention fails immediately
    /// with [`LockError::InProgress`] carrying the holder's record.
    pub fn acquire(&self, subject: &str) -> Result<LockHandle, LockError> {
        let mut file = self.open()?;
        if let Err(error) = file.try_lock_exclusive() {
            if error.kind() == fs2::lock_contended_error().kind() {
                let record = read_record(&mut file).ok().flatten();
                return Err(LockError::InProgress(record));
            }
            return Err(self.io_error(error));
        }

        let record = LockRecord::for_current_process(subject);
        if let Err(error) = write_record(&mut file, &record) {
            let _ = FileExt::unlock(&file);
            return Err(self.io_error(error));
        }

        tracing::debug!(
            path = %self.path.display(),
            pid = record.holder_pid,
            subject = %record.subject,
            "lock acquired"
        );

        Ok(LockHandle {
            path: self.path.clone(),
            file: Some(file),
            record,
        })
    }

    /// Reads the on-disk record without taking the lock. A record whose
    /// holder is dead is reported as not in progress.
    pub fn inspect(&self) -> Result<LockStatus, LockError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(LockStatus {
                    in_progress: false,
                    stale: false,
                    record: None,
                });
            }
            Err(error) => return Err(self.io_error(error)),
        };

        let record = match read_record(&mut file) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "unreadable lock record");
                None
            }
        };

        Ok(match record {
            Some(record) if pid_alive(record.holder_pid) => LockStatus {
                in_progress: true,
                stale: false,
                record: Some(record),
            },
            Some(record) => LockStatus {
                in_progress: false,
                stale: true,
                record: Some(record),
            },
            None => LockStatus {
                in_progress: false,
                stale: false,
                record: None,
            },
        })
    }

    /// Clears a leftover record when nobody holds the lock. Returns whether
    /// a record was removed. Safe to call at any time.
    pub fn clear_stale(&self) -> Result<bool, LockError> {
        if !self.path.exists() {
            return Ok(false);
        }
        let mut file = self.open()?;
        if file.try_lock_exclusive().is_err() {
            return Ok(false);
        }
        let had_record = read_record(&mut file).ok().flatten().is_some();
        let cleared = file.set_len(0);
        let _ = FileExt::unlock(&file);
        cleared.map_err(|error| self.io_error(error))?;
        if had_record {
            tracing::info!(path = %self.path.display(), "cleared stale lock record");
        }
        Ok(had_record)
    }

    fn open(&self) -> Result<File, LockError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|error| self.io_error(error))?;
            }
        }
        // Never truncate on open: the current holder's record must survive a
        // contended attempt.
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|error| self.io_error(error))
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Scoped ownership of an acquired lock. Released on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: Option<File>,
    record: LockRecord,
}

impl LockHandle {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    #[cfg(test)]
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Truncates the record and drops the OS lock. Idempotent.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Err(error) = file.set_len(0) {
            tracing::warn!(%error, path = %self.path.display(), "failed to clear lock record");
        }
        if let Err(error) = FileExt::unlock(&file) {
            tracing::warn!(%error, path = %self.path.display(), "failed to unlock");
        }
        tracing::debug!(path = %self.path.display(), "lock released");
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Liveness probe via signal 0. EPERM means the pid exists under another user.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_record(file: &mut File) -> io::Result<Option<LockRecord>> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn write_record(file: &mut File, record: &LockRecord) -> io::Result<()> {
    let contents =
        serde_json::to_vec(record).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&contents)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait for true");
        pid
    }

    #[test]
    fn second_acquire_is_rejected_with_holder_record() {
        let dir = tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path().join("deploy.lock"));

        let first = lock.acquire("http://ci/artifact/1").expect("first acquire");
        let error = AdvisoryLock::new(lock.path())
            .acquire("http://ci/artifact/2")
            .unwrap_err();

        match error {
            LockError::InProgress(Some(record)) => {
                assert_eq!(record.holder_pid, process::id());
                assert_eq!(record.subject, "http://ci/artifact/1");
                assert_eq!(&record, first.record());
            }
            other => panic!("expected InProgress, got {other:?}"),
        }
        assert!(error_message_names_in_progress(&lock));
    }

    fn error_message_names_in_progress(lock: &AdvisoryLock) -> bool {
        lock.acquire("again")
            .unwrap_err()
            .to_string()
            .starts_with("InProgress")
    }

    #[test]
    fn release_allows_next_acquire_and_clears_record() {
        let dir = tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path().join("deploy.lock"));

        let mut handle = lock.acquire("one").unwrap();
        assert!(lock.inspect().unwrap().in_progress);
        handle.release();
        assert!(!handle.is_held());

        let status = lock.inspect().unwrap();
        assert!(!status.in_progress);
        assert!(status.record.is_none());

        let _handle = lock.acquire("two").expect("acquire after release");
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path().join("deploy.lock"));

        let mut handle = lock.acquire("one").unwrap();
        handle.release();
        handle.release();
        drop(handle);

        assert!(!lock.clear_stale().unwrap());
        let status = lock.inspect().unwrap();
        assert_eq!(
            status,
            LockStatus {
                in_progress: false,
                stale: false,
                record: None
            }
        );
    }

    #[test]
    fn never_acquired_lock_reports_idle() {
        let dir = tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path().join("missing.lock"));
        assert!(!lock.clear_stale().unwrap());
        assert!(!lock.inspect().unwrap().in_progress);
        assert!(!lock.path().exists());
    }

    #[test]
    fn dead_holder_is_stale_and_does_not_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deploy.lock");
        let record = LockRecord {
            holder_pid: dead_pid(),
            started_at: Utc::now(),
            subject: "crashed deploy".to_string(),
        };
        fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let lock = AdvisoryLock::new(&path);
        let status = lock.inspect().unwrap();
        assert!(!status.in_progress);
        assert!(status.stale);
        assert_eq!(status.record, Some(record));

        let handle = lock.acquire("fresh deploy").expect("stale lock must not block");
        assert_eq!(handle.record().subject, "fresh deploy");
    }

    #[test]
    fn clear_stale_removes_leftover_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deploy.lock");
        let record = LockRecord {
            holder_pid: dead_pid(),
            started_at: Utc::now(),
            subject: "old".to_string(),
        };
        fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let lock = AdvisoryLock::new(&path);
        assert!(lock.clear_stale().unwrap());
        assert!(lock.inspect().unwrap().record.is_none());
    }

    #[test]
    fn clear_stale_leaves_live_holder_alone() {
        let dir = tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path().join("deploy.lock"));
        let _handle = lock.acquire("live").unwrap();

        assert!(!lock.clear_stale().unwrap());
        assert!(lock.inspect().unwrap().in_progress);
    }

    #[test]
    fn subject_is_truncated() {
        let dir = tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path().join("deploy.lock"));
        let long = "x".repeat(250);
        let handle = lock.acquire(&long).unwrap();
        assert_eq!(handle.record().subject.chars().count(), MAX_SUBJECT_CHARS);
    }

    #[test]
    fn pid_probe_distinguishes_live_and_dead() {
        assert!(pid_alive(process::id()));
        assert!(!pid_alive(dead_pid()));
        assert!(!pid_alive(0));
    }
}
