use std::time::Instant;

use serde::Serialize;

use crate::service::ServiceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    LockPending,
    Stopping,
    Installing,
    Starting,
    Verifying,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployStep {
    pub step: &'static str,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
}

/// Outcome of one deploy attempt. Built per request and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployResult {
    pub success: bool,
    pub state: DeployState,
    pub source: String,
    pub steps: Vec<DeployStep>,
    pub error: Option<String>,
    /// Whether this attempt held the deploy lock.
    pub locked: bool,
    pub duration_ms: u64,
    /// Rejected because another deploy held the lock.
    #[serde(skip)]
    pub contended: bool,
}

impl DeployResult {
    pub fn message(&self) -> String {
        match &self.error {
            None => "Deployment successful".to_string(),
            Some(error) => format!("Deployment failed: {error}"),
        }
    }

    pub fn failed_step(&self) -> Option<&'static str> {
        self.steps
            .iter()
            .rev()
            .find(|step| !step.success && step.step != "rollback")
            .map(|step| step.step)
    }
}

/// Mutable record of an attempt while the pipeline runs.
#[derive(Debug)]
pub(super) struct DeployRun {
    pub(super) source: String,
    pub(super) state: DeployState,
    pub(super) steps: Vec<DeployStep>,
    pub(super) locked: bool,
    pub(super) contended: bool,
    started: Instant,
}

impl DeployRun {
    pub(super) fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            state: DeployState::LockPending,
            steps: Vec::new(),
            locked: false,
            contended: false,
            started: Instant::now(),
        }
    }

    pub(super) fn enter(&mut self, state: DeployState) {
        tracing::debug!(source = %self.source, ?state, "deploy state");
        self.state = state;
    }

    pub(super) fn record(&mut self, step: &'static str, success: bool, message: impl Into<String>) {
        self.record_with_status(step, success, message, None);
    }

    pub(super) fn record_with_status(
        &mut self,
        step: &'static str,
        success: bool,
        message: impl Into<String>,
        status: Option<ServiceStatus>,
    ) {
        let message = message.into();
        if success {
            tracing::info!(step, %message, "deploy step succeeded");
        } else {
            tracing::warn!(step, %message, "deploy step failed");
        }
        self.steps.push(DeployStep {
            step,
            success,
            message,
            status,
        });
    }

    pub(super) fn finish(self, error: Option<String>) -> DeployResult {
        let success = error.is_none();
        tracing::debug!(reached = ?self.state, success, "deploy pipeline finished");
        DeployResult {
            success,
            state: if success {
                DeployState::Success
            } else {
                DeployState::Failed
            },
            source: self.source,
            steps: self.steps,
            error,
            locked: self.locked,
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            contended: self.contended,
        }
    }
}
