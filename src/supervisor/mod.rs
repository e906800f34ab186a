//! Long-lived owner of the game server process.
//!
//! One supervisor per host: a liveness-checked lock file guards the session.
//! Each run launches the server once, waits for it to exit (or for a
//! termination signal), folds the outcome into the persisted history and
//! exits with the server's own exit code.

pub mod session;

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, SupervisorConfig},
    env,
    lock::{AdvisoryLock, LockError},
    logging,
    notify::{self, Notification, Notifier, Severity},
    state::{self, CrashEntry, StateError, StateStore, SupervisorState},
};
use session::{LaunchSpec, SessionBackend, SessionExit};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("server binary not found: {}", .0.display())]
    BinaryMissing(PathBuf),
    #[error("SupervisorAlreadyRunning: {0}")]
    AlreadyRunning(LockError),
    #[error(transparent)]
    Lock(LockError),
    #[error("failed to load environment file: {0}")]
    Environment(String),
    #[error("failed to launch server: {0}")]
    Launch(String),
    #[error("failed to run `{command}`: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<LockError> for SupervisorError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::InProgress(_) => SupervisorError::AlreadyRunning(error),
            LockError::Io { .. } => SupervisorError::Lock(error),
        }
    }
}

/// History change caused by the server exiting.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitTransition {
    CleanStop { run_seconds: Option<f64> },
    Crash(CrashEntry),
}

/// Exit code zero is a clean stop; anything else is a crash.
pub fn apply_exit(
    state: &mut SupervisorState,
    exit: &SessionExit,
    at: DateTime<Utc>,
) -> ExitTransition {
    match exit.code() {
        0 => ExitTransition::CleanStop {
            run_seconds: state.record_stop(at),
        },
        code => ExitTransition::Crash(state.record_crash(at, code)),
    }
}

#[derive(Debug)]
pub struct Supervisor {
    binary: PathBuf,
    config: SupervisorConfig,
    ports: BTreeMap<String, String>,
    lock: AdvisoryLock,
    store: StateStore,
    backend: Box<dyn SessionBackend>,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        backend: Box<dyn SessionBackend>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            binary: config.server.binary_path.clone(),
            config: config.supervisor.clone(),
            ports: config.notify.ports.clone(),
            lock: AdvisoryLock::new(&config.supervisor.lock_file),
            store: StateStore::new(&config.supervisor.state_file),
            backend,
            notifier,
            shutdown,
        }
    }

    /// Runs the server to completion and returns the exit code the
    /// supervisor itself should exit with.
    pub async fn run(mut self) -> Result<i32, SupervisorError> {
        if !self.binary.is_file() {
            return Err(SupervisorError::BinaryMissing(self.binary.clone()));
        }
        let mut lock = self
            .lock
            .acquire(&format!("supervise {}", self.binary.display()))?;

        let spec = self.launch_spec()?;
        let mut history = match self.store.load() {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(%error, "starting with empty supervisor history");
                SupervisorState::default()
            }
        };

        self.backend.cleanup_orphan().await?;
        self.backend.launch(&spec).await?;
        history.record_start(Utc::now());
        self.save(&history);
        tracing::info!(
            binary = %self.binary.display(),
            backend = self.config.session.as_str(),
            session = %self.backend.describe(),
            "server started"
        );
        self.announce_start().await;

        let exit = tokio::select! {
            exit = self.backend.wait() => Some(exit),
            () = self.shutdown.cancelled() => None,
        };

        let code = match exit {
            Some(exit) => self.handle_exit(&mut history, exit).await,
            None => {
                let forced = self.stop_session().await;
                let run_seconds = history.record_stop(Utc::now());
                self.save(&history);
                if forced {
                    self.announce_stop(
                        run_seconds,
                        &history,
                        Severity::Warning,
                        "was force-killed after ignoring the interrupt",
                    )
                    .await;
                } else {
                    self.announce_stop(run_seconds, &history, Severity::Info, "stopped by signal")
                        .await;
                }
                0
            }
        };

        lock.release();
        tracing::info!(code, "supervisor exiting");
        Ok(code)
    }

    fn launch_spec(&self) -> Result<LaunchSpec, SupervisorError> {
        let env = match &self.config.env_file {
            Some(path) => env::load_env_overrides(path)
                .map_err(|error| SupervisorError::Environment(format!("{error:#}")))?,
            None => BTreeMap::new(),
        };
        Ok(LaunchSpec {
            binary: self.binary.clone(),
            env,
            output_log: self.config.output_log.clone(),
            error_log: self.config.error_log.clone(),
        })
    }

    async fn handle_exit(&mut self, history: &mut SupervisorState, exit: SessionExit) -> i32 {
        let code = exit.code();
        if let SessionExit::Unknown(reason) = &exit {
            tracing::error!(%reason, "server exit status unavailable; treating as crash");
        }
        let transition = apply_exit(history, &exit, Utc::now());
        self.save(history);
        match transition {
            ExitTransition::CleanStop { run_seconds } => {
                tracing::info!("server stopped cleanly");
                self.announce_stop(run_seconds, history, Severity::Info, "exited cleanly")
                    .await;
            }
            ExitTransition::Crash(entry) => {
                tracing::error!(code, %exit, "server crashed");
                self.announce_crash(&entry, &exit).await;
            }
        }
        code
    }

    /// Interrupt, give the server the grace period, then force it down.
    /// Returns whether the kill was needed.
    async fn stop_session(&mut self) -> bool {
        tracing::info!("stopping server session");
        self.backend.interrupt().await;
        match timeout(self.config.shutdown_grace, self.backend.wait()).await {
            Ok(exit) => {
                tracing::info!(%exit, "server stopped after interrupt");
                false
            }
            Err(_) => {
                tracing::warn!("server ignored interrupt; killing session");
                self.backend.kill().await;
                true
            }
        }
    }

    /// The in-memory history stays authoritative when a save fails.
    fn save(&self, history: &SupervisorState) {
        if let Err(error) = self.store.save(history) {
            tracing::error!(
                %error,
                path = %self.store.path().display(),
                "failed to persist supervisor state"
            );
        }
    }

    async fn announce_start(&self) {
        let mut notification = Notification::new("Server started", Severity::Success)
            .description(format!("Running in {}", self.backend.describe()));
        for (name, port) in &self.ports {
            notification = notification.field(name, port);
        }
        notify::send_logged(self.notifier.as_ref(), notification).await;
    }

    async fn announce_stop(
        &self,
        run_seconds: Option<f64>,
        history: &SupervisorState,
        severity: Severity,
        how: &str,
    ) {
        let mut notification = Notification::new("Server stopped", severity)
            .description(format!("Server {how}"));
        if let Some(seconds) = run_seconds {
            notification = notification.field("Uptime", state::format_uptime(seconds));
        }
        notification = notification.field(
            "Total uptime",
            state::format_uptime(history.total_uptime_seconds),
        );
        notify::send_logged(self.notifier.as_ref(), notification).await;
    }

    async fn announce_crash(&self, entry: &CrashEntry, exit: &SessionExit) {
        let header = format!("Server {exit}\n\n**Recent errors**\n```\n");
        let room = notify::DESCRIPTION_LIMIT.saturating_sub(header.chars().count() + 4);
        let recent = self.recent_errors();
        let tail = last_chars(&recent, room);
        let notification = Notification::new("Server crashed", Severity::Error)
            .description(format!("{header}{tail}\n```"))
            .field("Exit code", entry.exit_code.to_string())
            .field(
                "Uptime",
                entry
                    .uptime_at_crash
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            );
        notify::send_logged(self.notifier.as_ref(), notification).await;
    }

    fn recent_errors(&self) -> String {
        let lines = self.config.error_tail_lines;
        let chars = self.config.error_tail_chars;
        let tail = [&self.config.error_log, &self.config.output_log]
            .into_iter()
            .find_map(|path| read_tail(path, lines, chars));
        tail.unwrap_or_else(|| "No error output captured".to_string())
    }
}

fn last_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    text.char_indices()
        .nth(skip)
        .map_or("", |(index, _)| &text[index..])
}

fn read_tail(path: &Path, lines: usize, chars: usize) -> Option<String> {
    match logging::tail_lines(path, lines, chars) {
        Ok(tail) if !tail.trim().is_empty() => Some(tail),
        Ok(_) => None,
        Err(error) => {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::warn!(%error, path = %path.display(), "could not read log tail");
            }
            None
        }
    }
}
