use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::paths;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_BACKUPS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub deploy: DeployConfig,
    pub backup: BackupConfig,
    pub service: ServiceConfig,
    pub supervisor: SupervisorConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub binary_path: PathBuf,
    pub service_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary_path: paths::default_binary_path(),
            service_name: "rtype-server".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub listen: SocketAddr,
    pub lock_file: PathBuf,
    pub settle_delay: Duration,
    pub download_timeout: Duration,
    pub restore_backup_on_failure: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            lock_file: paths::default_deploy_lock_path(),
            settle_delay: Duration::from_secs(2),
            download_timeout: Duration::from_secs(300),
            restore_backup_on_failure: false,
        }
    }
}

impl DeployConfig {
    /// Base URL clients use to reach the control surface.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.listen)
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: paths::default_backup_dir(),
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub program: String,
    pub privilege_command: Option<String>,
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub restart_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            program: "systemctl".to_string(),
            privilege_command: Some("sudo".to_string()),
            stop_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            restart_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Detached tmux session on a shared socket; operators can attach to it.
    Tmux,
    /// Child process owned directly by the supervisor.
    Direct,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Tmux => "tmux",
            SessionKind::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub session: SessionKind,
    pub session_name: String,
    pub tmux_socket: PathBuf,
    pub lock_file: PathBuf,
    pub state_file: PathBuf,
    pub runtime_dir: PathBuf,
    pub output_log: PathBuf,
    pub error_log: PathBuf,
    pub env_file: Option<PathBuf>,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub error_tail_lines: usize,
    pub error_tail_chars: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            session: SessionKind::Tmux,
            session_name: "rtype".to_string(),
            tmux_socket: paths::default_tmux_socket(),
            lock_file: paths::default_supervisor_lock_path(),
            state_file: paths::default_state_path(),
            runtime_dir: std::env::temp_dir(),
            output_log: paths::default_output_log(),
            error_log: paths::default_error_log(),
            env_file: None,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            error_tail_lines: 20,
            error_tail_chars: 1500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub footer: Option<String>,
    pub timeout: Duration,
    pub ports: BTreeMap<String, String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            footer: None,
            timeout: Duration::from_secs(10),
            ports: BTreeMap::new(),
        }
    }
}
