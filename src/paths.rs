use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rtype-ops/rtype-ops.toml";
pub const CONFIG_PATH_VAR: &str = "RTYPE_OPS_CONFIG";

pub fn install_root() -> PathBuf {
    PathBuf::from("/opt/rtype")
}

pub fn default_binary_path() -> PathBuf {
    install_root().join("server").join("rtype_server")
}

pub fn default_backup_dir() -> PathBuf {
    install_root().join("backups")
}

pub fn logs_dir() -> PathBuf {
    install_root().join("logs")
}

pub fn runtime_dir() -> PathBuf {
    PathBuf::from("/run/rtype-ops")
}

pub fn default_deploy_lock_path() -> PathBuf {
    runtime_dir().join("deploy.lock")
}

pub fn default_supervisor_lock_path() -> PathBuf {
    PathBuf::from("/tmp/rtype-server.lock")
}

pub fn default_state_path() -> PathBuf {
    install_root().join("state").join("supervisor.json")
}

pub fn default_tmux_socket() -> PathBuf {
    PathBuf::from("/tmp/rtype-tmux.sock")
}

pub fn default_output_log() -> PathBuf {
    logs_dir().join("server.log")
}

pub fn default_error_log() -> PathBuf {
    logs_dir().join("server-error.log")
}

/// Side-channel file the session shell writes the server's exit status into.
pub fn exit_status_path(dir: &Path, supervisor_pid: u32) -> PathBuf {
    dir.join(format!("rtype_exit_code_{supervisor_pid}"))
}
