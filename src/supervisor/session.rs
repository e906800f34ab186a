//! Session backends that host the managed server process.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt, fs, io,
    os::unix::{fs::PermissionsExt, process::ExitStatusExt},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use nix::{errno::Errno, sys::signal::Signal, unistd::Pid};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::{sleep, timeout},
};

use super::SupervisorError;
use crate::{
    config::{SessionKind, SupervisorConfig},
    logging::{LogEvent, LogStream, ServerLog},
    paths,
};

/// How the managed process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Exited(i32),
    Signaled(i32),
    /// The exit status never reached us.
    Unknown(String),
}

impl SessionExit {
    /// Conventional shell exit code. An unknown status counts as a failure.
    pub fn code(&self) -> i32 {
        match self {
            SessionExit::Exited(code) => *code,
            SessionExit::Signaled(signal) => 128 + signal,
            SessionExit::Unknown(_) => 1,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => SessionExit::Exited(code),
            (None, Some(signal)) => SessionExit::Signaled(signal),
            (None, None) => SessionExit::Unknown(format!("unrecognized exit status {status}")),
        }
    }
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionExit::Exited(code) => write!(f, "exited with code {code}"),
            SessionExit::Signaled(signal) => write!(f, "terminated by signal {signal}"),
            SessionExit::Unknown(reason) => write!(f, "exit status unknown ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub env: BTreeMap<String, String>,
    pub output_log: PathBuf,
    pub error_log: PathBuf,
}

#[async_trait]
pub trait SessionBackend: Send + fmt::Debug {
    fn describe(&self) -> String;
    /// Removes a leftover session of the same name from an earlier run.
    async fn cleanup_orphan(&mut self) -> Result<(), SupervisorError>;
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<(), SupervisorError>;
    /// Resolves once the managed process is gone. Cancel safe.
    async fn wait(&mut self) -> SessionExit;
    async fn interrupt(&mut self);
    async fn kill(&mut self);
}

pub fn from_config(config: &SupervisorConfig) -> Box<dyn SessionBackend> {
    match config.session {
        SessionKind::Tmux => Box::new(TmuxSession::new(
            &config.tmux_socket,
            &config.session_name,
            paths::exit_status_path(&config.runtime_dir, std::process::id()),
            config.poll_interval,
        )),
        SessionKind::Direct => Box::new(DirectSession::default()),
    }
}

/// Detached tmux session on a shared socket. The session's shell writes the
/// server's own exit status (not the pipeline's) to a side-channel file.
#[derive(Debug)]
pub struct TmuxSession {
    program: String,
    socket: PathBuf,
    name: String,
    exit_file: PathBuf,
    poll_interval: Duration,
}

impl TmuxSession {
    pub fn new(
        socket: impl Into<PathBuf>,
        name: impl Into<String>,
        exit_file: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            program: "tmux".to_string(),
            socket: socket.into(),
            name: name.into(),
            exit_file: exit_file.into(),
            poll_interval,
        }
    }

    #[cfg(test)]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output, SupervisorError> {
        Command::new(&self.program)
            .arg("-S")
            .arg(&self.socket)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SupervisorError::Command {
                command: format!("{} {}", self.program, args.join(" ")),
                source,
            })
    }

    async fn exists(&self) -> bool {
        match self.tmux(&["has-session", "-t", &self.name]).await {
            Ok(output) => output.status.success(),
            Err(error) => {
                tracing::warn!(%error, "could not query tmux session");
                false
            }
        }
    }

    async fn kill_session(&self) {
        if let Err(error) = self.tmux(&["kill-session", "-t", &self.name]).await {
            tracing::warn!(%error, session = %self.name, "failed to kill tmux session");
        }
    }

    pub fn launch_script(&self, spec: &LaunchSpec) -> String {
        let mut script = String::new();
        for (key, value) in &spec.env {
            script.push_str(&format!("export {key}={}; ", quote(value)));
        }
        script.push_str(&format!(
            "{} 2>&1 | tee -a {}; echo ${{PIPESTATUS[0]}} > {}",
            quote_path(&spec.binary),
            quote_path(&spec.output_log),
            quote_path(&self.exit_file),
        ));
        script
    }
}

#[async_trait]
impl SessionBackend for TmuxSession {
    fn describe(&self) -> String {
        format!("tmux session '{}' on {}", self.name, self.socket.display())
    }

    async fn cleanup_orphan(&mut self) -> Result<(), SupervisorError> {
        if self.exists().await {
            tracing::warn!(session = %self.name, "killing orphaned tmux session");
            self.kill_session().await;
            sleep(Duration::from_millis(500)).await;
        }
        remove_if_present(&self.exit_file);
        Ok(())
    }

    async fn launch(&mut self, spec: &LaunchSpec) -> Result<(), SupervisorError> {
        if let Some(parent) = spec.output_log.parent() {
            let _ = fs::create_dir_all(parent);
        }
        remove_if_present(&self.exit_file);

        let script = self.launch_script(spec);
        let output = self
            .tmux(&["new-session", "-d", "-s", &self.name, "bash", "-c", &script])
            .await?;
        if !output.status.success() {
            return Err(SupervisorError::Launch(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        // Operators attach from other accounts.
        if let Err(error) = fs::set_permissions(&self.socket, fs::Permissions::from_mode(0o777)) {
            tracing::warn!(
                %error,
                socket = %self.socket.display(),
                "could not open up tmux socket"
            );
        }
        tracing::info!(session = %self.name, "server launched in tmux");
        Ok(())
    }

    async fn wait(&mut self) -> SessionExit {
        while self.exists().await {
            sleep(self.poll_interval).await;
        }
        read_exit_status(&self.exit_file)
    }

    async fn interrupt(&mut self) {
        if let Err(error) = self.tmux(&["send-keys", "-t", &self.name, "C-c"]).await {
            tracing::warn!(%error, session = %self.name, "failed to interrupt tmux session");
        }
    }

    async fn kill(&mut self) {
        if self.exists().await {
            self.kill_session().await;
        }
    }
}

/// Reads and consumes the side-channel exit status.
pub fn read_exit_status(path: &Path) -> SessionExit {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) => {
            tracing::warn!(
                %error,
                path = %path.display(),
                "exit status file unreadable; assuming crash"
            );
            return SessionExit::Unknown(format!("no exit status at {}", path.display()));
        }
    };
    remove_if_present(path);
    match contents.trim().parse::<i32>() {
        Ok(code) => SessionExit::Exited(code),
        Err(_) => {
            tracing::warn!(path = %path.display(), "exit status file is malformed; assuming crash");
            SessionExit::Unknown(format!("malformed exit status {:?}", contents.trim()))
        }
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!(%error, path = %path.display(), "failed to remove file"),
    }
}

fn quote(value: &str) -> String {
    shell_escape::escape(Cow::Borrowed(value)).into_owned()
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Child owned directly by the supervisor. Output is duplicated to our own
/// stdout/stderr and to the durable server log.
#[derive(Debug, Default)]
pub struct DirectSession {
    child: Option<Child>,
    log: Option<ServerLog>,
    pumps: Vec<JoinHandle<()>>,
}

impl DirectSession {
    fn spawn_stream_task<R>(&mut self, stream: LogStream, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.log.clone();
        self.pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let echoed = match stream {
                    LogStream::Stderr => {
                        tokio::io::stderr()
                            .write_all(format!("{line}\n").as_bytes())
                            .await
                    }
                    _ => {
                        tokio::io::stdout()
                            .write_all(format!("{line}\n").as_bytes())
                            .await
                    }
                };
                if let Err(error) = echoed {
                    tracing::debug!(%error, "failed to echo server output");
                }
                if let Some(log) = &log {
                    if let Err(error) = log.log(LogEvent::new(stream).with_message(line)) {
                        tracing::error!(%error, "failed to log server output");
                    }
                }
            }
        }));
    }

    fn signal(&self, signal: Signal) {
        let Some(pid) = self.child.as_ref().and_then(Child::id) else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        match nix::sys::signal::kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => tracing::warn!(%error, pid, ?signal, "failed to signal server"),
        }
    }
}

#[async_trait]
impl SessionBackend for DirectSession {
    fn describe(&self) -> String {
        "direct child process".to_string()
    }

    async fn cleanup_orphan(&mut self) -> Result<(), SupervisorError> {
        Ok(())
    }

    async fn launch(&mut self, spec: &LaunchSpec) -> Result<(), SupervisorError> {
        let log = ServerLog::open(&spec.output_log, &spec.error_log)
            .map_err(|error| SupervisorError::Launch(format!("{error:#}")))?;

        let mut child = Command::new(&spec.binary)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Command {
                command: spec.binary.display().to_string(),
                source,
            })?;

        let started =
            LogEvent::new(LogStream::Started).with_message(spec.binary.display().to_string());
        if let Err(error) = log.log(started) {
            tracing::warn!(%error, "failed to log server start");
        }
        self.log = Some(log);

        if let Some(stdout) = child.stdout.take() {
            self.spawn_stream_task(LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stream_task(LogStream::Stderr, stderr);
        }
        tracing::info!(pid = child.id(), binary = %spec.binary.display(), "server launched");
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> SessionExit {
        let Some(child) = self.child.as_mut() else {
            return SessionExit::Unknown("server was never launched".to_string());
        };
        let exit = match child.wait().await {
            Ok(status) => SessionExit::from_status(status),
            Err(error) => SessionExit::Unknown(format!("wait failed: {error}")),
        };

        for pump in self.pumps.drain(..) {
            if timeout(Duration::from_secs(2), pump).await.is_err() {
                tracing::warn!("server output still open after exit; not waiting for it");
            }
        }
        if let Some(log) = &self.log {
            let _ = log.log(LogEvent::new(LogStream::Exited).with_message(exit.to_string()));
            if let Err(error) = log.flush() {
                tracing::warn!(%error, "failed to flush server log");
            }
        }
        exit
    }

    async fn interrupt(&mut self) {
        self.signal(Signal::SIGINT);
    }

    async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(error) = child.start_kill() {
                tracing::debug!(%error, "kill on exited server");
            }
            let _ = child.wait().await;
        }
    }
}
