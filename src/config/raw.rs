use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub server: RawServerConfig,
    #[serde(default)]
    pub deploy: RawDeployConfig,
    #[serde(default)]
    pub backup: RawBackupConfig,
    #[serde(default)]
    pub service: RawServiceConfig,
    #[serde(default)]
    pub supervisor: RawSupervisorConfig,
    #[serde(default)]
    pub notify: RawNotifyConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawServerConfig {
    pub binary_path: Option<String>,
    pub service_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawDeployConfig {
    pub listen: Option<String>,
    pub lock_file: Option<String>,
    pub settle_seconds: Option<u64>,
    pub download_timeout_seconds: Option<u64>,
    pub restore_backup_on_failure: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawBackupConfig {
    pub dir: Option<String>,
    pub max_backups: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawServiceConfig {
    pub program: Option<String>,
    /// Wrapper for mutating commands; an empty string disables it.
    pub privilege_command: Option<String>,
    pub stop_timeout_seconds: Option<u64>,
    pub start_timeout_seconds: Option<u64>,
    pub restart_timeout_seconds: Option<u64>,
    pub query_timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawSupervisorConfig {
    pub session: Option<String>,
    pub session_name: Option<String>,
    pub tmux_socket: Option<String>,
    pub lock_file: Option<String>,
    pub state_file: Option<String>,
    pub runtime_dir: Option<String>,
    pub output_log: Option<String>,
    pub error_log: Option<String>,
    pub env_file: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub shutdown_grace_seconds: Option<u64>,
    pub error_tail_lines: Option<usize>,
    pub error_tail_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawNotifyConfig {
    pub webhook_url: Option<String>,
    pub footer: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// Extra fields attached to the "server started" notification.
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
}
