use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{
    error::{ConfigError, ConfigResult},
    model::{
        BackupConfig, Config, DeployConfig, NotifyConfig, ServerConfig, ServiceConfig,
        SessionKind, SupervisorConfig,
    },
    raw::{
        RawBackupConfig, RawConfig, RawDeployConfig, RawNotifyConfig, RawServerConfig,
        RawServiceConfig, RawSupervisorConfig,
    },
};

pub const WEBHOOK_URL_VARS: [&str; 2] = ["RTYPE_OPS_WEBHOOK_URL", "DISCORD_WEBHOOK_URL"];

pub fn load_from_path<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
    let path_ref = path.as_ref();
    let raw_contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::ReadFailure {
        path: path_ref.to_path_buf(),
        source,
    })?;
    load_from_str(path_ref, &raw_contents)
}

pub fn load_from_str(config_path: &Path, contents: &str) -> ConfigResult<Config> {
    let raw: RawConfig = toml::from_str(contents)?;
    convert_raw_config(config_path, raw)
}

/// Loads the config file if present, falling back to defaults when it does not
/// exist, then applies environment overrides.
pub fn load_or_default(path: &Path) -> ConfigResult<Config> {
    let mut config = match load_from_path(path) {
        Ok(config) => config,
        Err(ConfigError::ReadFailure { source, .. })
            if source.kind() == io::ErrorKind::NotFound =>
        {
            tracing::debug!(path = %path.display(), "config file not found; using defaults");
            Config::default()
        }
        Err(error) => return Err(error),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for key in WEBHOOK_URL_VARS {
        if let Some(value) = lookup(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.notify.webhook_url = Some(trimmed.to_string());
                return;
            }
        }
    }
}

fn convert_raw_config(config_path: &Path, raw: RawConfig) -> ConfigResult<Config> {
    Ok(Config {
        server: convert_server_config(config_path, raw.server)?,
        deploy: convert_deploy_config(config_path, raw.deploy)?,
        backup: convert_backup_config(config_path, raw.backup)?,
        service: convert_service_config(raw.service)?,
        supervisor: convert_supervisor_config(config_path, raw.supervisor)?,
        notify: convert_notify_config(raw.notify),
    })
}

fn convert_server_config(config_path: &Path, raw: RawServerConfig) -> ConfigResult<ServerConfig> {
    let mut config = ServerConfig::default();
    if let Some(path) = raw.binary_path {
        config.binary_path = resolve_relative_path(config_path, path);
    }
    if let Some(name) = raw.service_name {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyValue {
                field: "server.service_name",
            });
        }
        config.service_name = name.to_string();
    }
    Ok(config)
}

fn convert_deploy_config(config_path: &Path, raw: RawDeployConfig) -> ConfigResult<DeployConfig> {
    let mut config = DeployConfig::default();
    if let Some(listen) = raw.listen {
        config.listen = listen
            .trim()
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListenAddress { value: listen })?;
    }
    if let Some(path) = raw.lock_file {
        config.lock_file = resolve_relative_path(config_path, path);
    }
    if let Some(seconds) = raw.settle_seconds {
        config.settle_delay = Duration::from_secs(seconds);
    }
    if let Some(seconds) = raw.download_timeout_seconds {
        config.download_timeout = positive_seconds("deploy.download_timeout_seconds", seconds)?;
    }
    if let Some(value) = raw.restore_backup_on_failure {
        config.restore_backup_on_failure = value;
    }
    Ok(config)
}

fn convert_backup_config(config_path: &Path, raw: RawBackupConfig) -> ConfigResult<BackupConfig> {
    let mut config = BackupConfig::default();
    if let Some(dir) = raw.dir {
        config.dir = resolve_relative_path(config_path, dir);
    }
    if let Some(max) = raw.max_backups {
        if max == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "backup.max_backups",
                min: 1,
            });
        }
        config.max_backups = max;
    }
    Ok(config)
}

fn convert_service_config(raw: RawServiceConfig) -> ConfigResult<ServiceConfig> {
    let mut config = ServiceConfig::default();
    if let Some(program) = raw.program {
        let program = program.trim();
        if program.is_empty() {
            return Err(ConfigError::EmptyValue {
                field: "service.program",
            });
        }
        config.program = program.to_string();
    }
    if let Some(privilege) = raw.privilege_command {
        let privilege = privilege.trim();
        config.privilege_command = if privilege.is_empty() {
            None
        } else {
            Some(privilege.to_string())
        };
    }
    if let Some(seconds) = raw.stop_timeout_seconds {
        config.stop_timeout = positive_seconds("service.stop_timeout_seconds", seconds)?;
    }
    if let Some(seconds) = raw.start_timeout_seconds {
        config.start_timeout = positive_seconds("service.start_timeout_seconds", seconds)?;
    }
    if let Some(seconds) = raw.restart_timeout_seconds {
        config.restart_timeout = positive_seconds("service.restart_timeout_seconds", seconds)?;
    }
    if let Some(seconds) = raw.query_timeout_seconds {
        config.query_timeout = positive_seconds("service.query_timeout_seconds", seconds)?;
    }
    Ok(config)
}

fn convert_supervisor_config(
    config_path: &Path,
    raw: RawSupervisorConfig,
) -> ConfigResult<SupervisorConfig> {
    let mut config = SupervisorConfig::default();
    if let Some(session) = raw.session {
        config.session = parse_session_kind(&session)?;
    }
    if let Some(name) = raw.session_name {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyValue {
                field: "supervisor.session_name",
            });
        }
        config.session_name = name.to_string();
    }
    if let Some(path) = raw.tmux_socket {
        config.tmux_socket = resolve_relative_path(config_path, path);
    }
    if let Some(path) = raw.lock_file {
        config.lock_file = resolve_relative_path(config_path, path);
    }
    if let Some(path) = raw.state_file {
        config.state_file = resolve_relative_path(config_path, path);
    }
    if let Some(path) = raw.runtime_dir {
        config.runtime_dir = resolve_relative_path(config_path, path);
    }
    if let Some(path) = raw.output_log {
        config.output_log = resolve_relative_path(config_path, path);
    }
    if let Some(path) = raw.error_log {
        config.error_log = resolve_relative_path(config_path, path);
    }
    config.env_file = raw.env_file.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(resolve_relative_path(config_path, trimmed.to_string()))
        }
    });
    if let Some(millis) = raw.poll_interval_ms {
        config.poll_interval = Duration::from_millis(millis.max(50));
    }
    if let Some(seconds) = raw.shutdown_grace_seconds {
        config.shutdown_grace = Duration::from_secs(seconds);
    }
    if let Some(lines) = raw.error_tail_lines {
        config.error_tail_lines = lines.max(1);
    }
    if let Some(chars) = raw.error_tail_chars {
        config.error_tail_chars = chars.max(1);
    }
    Ok(config)
}

fn convert_notify_config(raw: RawNotifyConfig) -> NotifyConfig {
    let mut config = NotifyConfig::default();
    config.webhook_url = raw
        .webhook_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    config.footer = raw.footer.filter(|value| !value.trim().is_empty());
    if let Some(seconds) = raw.timeout_seconds {
        config.timeout = Duration::from_secs(seconds.max(1));
    }
    config.ports = raw.ports;
    config
}

fn parse_session_kind(value: &str) -> ConfigResult<SessionKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "tmux" => Ok(SessionKind::Tmux),
        "direct" => Ok(SessionKind::Direct),
        _ => Err(ConfigError::UnknownSessionKind {
            value: value.to_string(),
        }),
    }
}

fn positive_seconds(field: &'static str, seconds: u64) -> ConfigResult<Duration> {
    if seconds == 0 {
        return Err(ConfigError::BelowMinimum { field, min: 1 });
    }
    Ok(Duration::from_secs(seconds))
}

fn resolve_relative_path(base: &Path, value: String) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return path;
    }

    let base_dir = if base.is_dir() {
        base.to_path_buf()
    } else {
        base.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    };
    base_dir.join(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, io::Write};

    use tempfile::NamedTempFile;

    fn fixture_path() -> &'static Path {
        Path::new("/tmp/rtype-ops/rtype-ops.toml")
    }

    #[test]
    fn parses_sample_configuration() {
        let toml = r#"
[server]
binary_path = "/opt/rtype/server/rtype_server"
service_name = "rtype-server"

[deploy]
listen = "127.0.0.1:9090"
lock_file = "run/deploy.lock"
settle_seconds = 3
restore_backup_on_failure = true

[backup]
dir = "backups"
max_backups = 3

[service]
privilege_command = ""
restart_timeout_seconds = 90

[supervisor]
session = "direct"
session_name = "rtype-test"
state_file = "state/supervisor.json"
env_file = ".env"
poll_interval_ms = 250

[notify]
webhook_url = "https://hooks.example.invalid/abc"
footer = "VPS"
ports.game = "UDP 4124"
ports.auth = "TCP 4125"
"#;

        let config = load_from_str(fixture_path(), toml).expect("config parsed");

        assert_eq!(
            config.server.binary_path,
            PathBuf::from("/opt/rtype/server/rtype_server")
        );
        assert_eq!(config.deploy.listen, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.deploy.endpoint(), "http://127.0.0.1:9090");
        assert_eq!(
            config.deploy.lock_file,
            PathBuf::from("/tmp/rtype-ops/run/deploy.lock")
        );
        assert_eq!(config.deploy.settle_delay, Duration::from_secs(3));
        assert!(config.deploy.restore_backup_on_failure);
        assert_eq!(config.backup.dir, PathBuf::from("/tmp/rtype-ops/backups"));
        assert_eq!(config.backup.max_backups, 3);
        assert_eq!(config.service.privilege_command, None);
        assert_eq!(config.service.restart_timeout, Duration::from_secs(90));
        assert_eq!(config.service.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.supervisor.session, SessionKind::Direct);
        assert_eq!(config.supervisor.session_name, "rtype-test");
        assert_eq!(
            config.supervisor.env_file,
            Some(PathBuf::from("/tmp/rtype-ops/.env"))
        );
        assert_eq!(config.supervisor.poll_interval, Duration::from_millis(250));
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("https://hooks.example.invalid/abc")
        );
        assert_eq!(config.notify.ports.len(), 2);
        assert_eq!(config.notify.ports["game"], "UDP 4124");
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = load_from_str(fixture_path(), "").expect("config parsed");
        assert_eq!(config.backup.max_backups, 5);
        assert_eq!(config.deploy.settle_delay, Duration::from_secs(2));
        assert_eq!(config.service.privilege_command.as_deref(), Some("sudo"));
        assert_eq!(config.supervisor.session, SessionKind::Tmux);
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn rejects_unknown_session_backend() {
        let toml = "[supervisor]\nsession = \"screen\"\n";
        let error = load_from_str(fixture_path(), toml).unwrap_err();
        match error {
            ConfigError::UnknownSessionKind { value } => assert_eq!(value, "screen"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_backups_and_bad_listen_address() {
        let error = load_from_str(fixture_path(), "[backup]\nmax_backups = 0\n").unwrap_err();
        assert!(matches!(error, ConfigError::BelowMinimum { .. }));

        let error =
            load_from_str(fixture_path(), "[deploy]\nlisten = \"localhost\"\n").unwrap_err();
        assert!(matches!(error, ConfigError::InvalidListenAddress { .. }));
    }

    #[test]
    fn webhook_url_can_come_from_environment() {
        let mut config = Config::default();
        let vars = HashMap::from([("DISCORD_WEBHOOK_URL", "https://hooks.example.invalid/env")]);
        apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("https://hooks.example.invalid/env")
        );

        let vars = HashMap::from([
            ("RTYPE_OPS_WEBHOOK_URL", "https://hooks.example.invalid/ops"),
            ("DISCORD_WEBHOOK_URL", "https://hooks.example.invalid/env"),
        ]);
        apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("https://hooks.example.invalid/ops")
        );
    }

    #[test]
    fn load_from_path_reads_file() {
        let mut temp = NamedTempFile::new().expect("temp file");
        writeln!(temp, "[backup]\ndir = \"bk\"").unwrap();
        let temp_path = temp.into_temp_path();
        let path_buf = temp_path.to_path_buf();
        let config = load_from_path(&path_buf).expect("config loads");
        let expected_dir = path_buf.parent().unwrap().join("bk");
        assert_eq!(config.backup.dir, expected_dir);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = PathBuf::from("/nonexistent/rtype-ops/config.toml");
        let error = load_from_path(&path).unwrap_err();
        assert!(matches!(error, ConfigError::ReadFailure { .. }));

        let config = load_or_default(&path).expect("defaults");
        assert_eq!(config.server.service_name, "rtype-server");
    }
}
