//! Control of the managed system service through the service manager.

use std::{collections::HashMap, fmt, io, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};

use crate::config::ServiceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStep {
    Stop,
    Start,
    Restart,
    Query,
}

impl ServiceStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStep::Stop => "stop",
            ServiceStep::Start => "start",
            ServiceStep::Restart => "restart",
            ServiceStep::Query => "query",
        }
    }
}

impl fmt::Display for ServiceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{step} failed: {message}")]
    CommandFailed { step: ServiceStep, message: String },
    #[error("{step} timed out after {}s", .timeout.as_secs())]
    Timeout { step: ServiceStep, timeout: Duration },
    #[error("could not run service manager for {step}: {source}")]
    Spawn {
        step: ServiceStep,
        #[source]
        source: io::Error,
    },
}

impl ServiceError {
    pub fn step(&self) -> ServiceStep {
        match self {
            ServiceError::CommandFailed { step, .. }
            | ServiceError::Timeout { step, .. }
            | ServiceError::Spawn { step, .. } => *step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub active: bool,
    pub state: String,
    pub substate: String,
    pub pid: String,
}

#[async_trait]
pub trait ServiceManager: Send + Sync + fmt::Debug {
    fn unit(&self) -> &str;
    async fn stop(&self) -> Result<String, ServiceError>;
    async fn start(&self) -> Result<String, ServiceError>;
    async fn restart(&self) -> Result<String, ServiceError>;
    async fn status(&self) -> Result<ServiceStatus, ServiceError>;
}

/// `systemctl`-style manager. Mutating commands go through the configured
/// privilege wrapper; queries run unprivileged.
#[derive(Debug, Clone)]
pub struct Systemctl {
    unit: String,
    config: ServiceConfig,
}

impl Systemctl {
    pub fn new(unit: impl Into<String>, config: ServiceConfig) -> Self {
        Self {
            unit: unit.into(),
            config,
        }
    }

    fn command(&self, privileged: bool) -> Command {
        let mut command = match (&self.config.privilege_command, privileged) {
            (Some(wrapper), true) => {
                let mut command = Command::new(wrapper);
                command.arg(&self.config.program);
                command
            }
            _ => Command::new(&self.config.program),
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(
        &self,
        step: ServiceStep,
        args: &[&str],
        privileged: bool,
        limit: Duration,
    ) -> Result<std::process::Output, ServiceError> {
        let mut command = self.command(privileged);
        command.args(args);
        tracing::debug!(unit = %self.unit, %step, ?args, "running service manager");
        match timeout(limit, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(ServiceError::Spawn { step, source }),
            Err(_) => Err(ServiceError::Timeout {
                step,
                timeout: limit,
            }),
        }
    }

    async fn mutate(
        &self,
        step: ServiceStep,
        verb: &str,
        limit: Duration,
        done: &str,
    ) -> Result<String, ServiceError> {
        tracing::info!(unit = %self.unit, %step, "service {verb} requested");
        let output = self.run(step, &[verb, &self.unit], true, limit).await?;
        if output.status.success() {
            tracing::info!(unit = %self.unit, "{done}");
            Ok(done.to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{verb} exited with {}", output.status)
            } else {
                stderr
            };
            Err(ServiceError::CommandFailed { step, message })
        }
    }
}

#[async_trait]
impl ServiceManager for Systemctl {
    fn unit(&self) -> &str {
        &self.unit
    }

    async fn stop(&self) -> Result<String, ServiceError> {
        self.mutate(ServiceStep::Stop, "stop", self.config.stop_timeout, "Service stopped")
            .await
    }

    async fn start(&self) -> Result<String, ServiceError> {
        self.mutate(
            ServiceStep::Start,
            "start",
            self.config.start_timeout,
            "Service started",
        )
        .await
    }

    async fn restart(&self) -> Result<String, ServiceError> {
        self.mutate(
            ServiceStep::Restart,
            "restart",
            self.config.restart_timeout,
            "Service restarted",
        )
        .await
    }

    async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        let limit = self.config.query_timeout;
        // is-active exits nonzero for inactive units; only its output matters.
        let active = self
            .run(ServiceStep::Query, &["is-active", &self.unit], false, limit)
            .await?;
        let active = String::from_utf8_lossy(&active.stdout).trim() == "active";

        let show = self
            .run(
                ServiceStep::Query,
                &[
                    "show",
                    &self.unit,
                    "--property=ActiveState,SubState,MainPID",
                ],
                false,
                limit,
            )
            .await?;
        let props = parse_show_output(&String::from_utf8_lossy(&show.stdout));

        Ok(status_from_props(&self.unit, active, &props))
    }
}

pub fn parse_show_output(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn status_from_props(unit: &str, active: bool, props: &HashMap<String, String>) -> ServiceStatus {
    let prop = |key: &str, default: &str| {
        props
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    ServiceStatus {
        service: unit.to_string(),
        active,
        state: prop("ActiveState", "unknown"),
        substate: prop("SubState", "unknown"),
        pid: prop("MainPID", "0"),
    }
}
