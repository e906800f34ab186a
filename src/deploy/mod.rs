//! Deployment pipeline: stop the service, install the new binary, start it
//! again and verify it stays up, all under the deploy lock.

mod result;

use std::{sync::Arc, time::Duration};

use thiserror::Error;

pub use result::{DeployResult, DeployState};
use result::DeployRun;

use crate::{
    config::Config,
    installer::{BackupEntry, BinaryInstaller, InstallError, InstallOutcome},
    lock::{AdvisoryLock, LockError, LockStatus},
    notify::{self, Notification, Notifier, Severity},
    service::{ServiceError, ServiceManager},
};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    LockContention(LockError),
    #[error("deploy lock unavailable: {0}")]
    LockUnavailable(LockError),
    #[error(transparent)]
    DownloadFailed(InstallError),
    #[error(transparent)]
    InvalidArtifact(InstallError),
    #[error("install failed: {0}")]
    InstallFailed(InstallError),
    #[error("service command failed: {0}")]
    ServiceCommandFailed(ServiceError),
    #[error("service command timed out: {0}")]
    ServiceCommandTimeout(ServiceError),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

impl From<LockError> for DeployError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::InProgress(_) => DeployError::LockContention(error),
            LockError::Io { .. } => DeployError::LockUnavailable(error),
        }
    }
}

impl From<InstallError> for DeployError {
    fn from(error: InstallError) -> Self {
        match error {
            InstallError::DownloadFailed { .. } => DeployError::DownloadFailed(error),
            InstallError::SourceNotFound(_) | InstallError::InvalidArtifact { .. } => {
                DeployError::InvalidArtifact(error)
            }
            InstallError::Io { .. } | InstallError::Aborted(_) => DeployError::InstallFailed(error),
        }
    }
}

impl From<ServiceError> for DeployError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Timeout { .. } => DeployError::ServiceCommandTimeout(error),
            _ => DeployError::ServiceCommandFailed(error),
        }
    }
}

/// Everything a deploy needs, passed explicitly to each entry point.
#[derive(Debug, Clone)]
pub struct DeployContext {
    lock: AdvisoryLock,
    installer: BinaryInstaller,
    service: Arc<dyn ServiceManager>,
    notifier: Arc<dyn Notifier>,
    settle_delay: Duration,
    restore_backup_on_failure: bool,
}

impl DeployContext {
    pub fn new(
        lock: AdvisoryLock,
        installer: BinaryInstaller,
        service: Arc<dyn ServiceManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            lock,
            installer,
            service,
            notifier,
            settle_delay: Duration::from_secs(2),
            restore_backup_on_failure: false,
        }
    }

    pub fn from_config(
        config: &Config,
        service: Arc<dyn ServiceManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, InstallError> {
        let installer = BinaryInstaller::from_config(config)?;
        Ok(Self::new(
            AdvisoryLock::new(&config.deploy.lock_file),
            installer,
            service,
            notifier,
        )
        .with_settle_delay(config.deploy.settle_delay)
        .with_restore_backup_on_failure(config.deploy.restore_backup_on_failure))
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_restore_backup_on_failure(mut self, enabled: bool) -> Self {
        self.restore_backup_on_failure = enabled;
        self
    }

    pub fn installer(&self) -> &BinaryInstaller {
        &self.installer
    }

    pub fn service(&self) -> &Arc<dyn ServiceManager> {
        &self.service
    }

    pub fn deploy_status(&self) -> Result<LockStatus, LockError> {
        self.lock.inspect()
    }

    /// Drops a deploy record left behind by a previous service instance that
    /// died mid-deploy. A deploy currently holding the lock is left alone.
    pub fn clear_stale_lock(&self) -> Result<bool, LockError> {
        self.lock.clear_stale()
    }

    /// Runs one deploy attempt. Never blocks on a concurrent deploy: a held
    /// lock fails the attempt immediately.
    ///
    /// The attempt runs on its own task and completes even if the returned
    /// future is dropped, so a stopped service is always started again.
    pub async fn deploy(&self, source: &str) -> DeployResult {
        let ctx = self.clone();
        let owned = source.to_string();
        match tokio::spawn(async move { ctx.attempt(&owned).await }).await {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(%error, %source, "deploy task did not complete");
                DeployRun::new(source).finish(Some(format!("deploy task aborted: {error}")))
            }
        }
    }

    async fn attempt(&self, source: &str) -> DeployResult {
        let mut run = DeployRun::new(source);
        tracing::info!(%source, "deploy requested");

        let mut handle = match self.lock.acquire(source) {
            Ok(handle) => handle,
            Err(error) => {
                let error = DeployError::from(error);
                run.contended = matches!(error, DeployError::LockContention(_));
                run.record("lock", false, error.to_string());
                let result = run.finish(Some(error.to_string()));
                self.announce(&result, None).await;
                return result;
            }
        };
        run.locked = true;
        run.record(
            "lock",
            true,
            format!("acquired by pid {}", handle.record().holder_pid),
        );

        let outcome = self.run_locked(&mut run).await;
        handle.release();

        let result = run.finish(outcome.as_ref().err().map(ToString::to_string));
        self.announce(&result, outcome.ok().as_ref()).await;
        if result.success {
            tracing::info!(
                source = %result.source,
                duration_ms = result.duration_ms,
                "deploy succeeded"
            );
        } else {
            tracing::error!(
                source = %result.source,
                error = result.error.as_deref().unwrap_or_default(),
                "deploy failed"
            );
        }
        result
    }

    async fn run_locked(&self, run: &mut DeployRun) -> Result<InstallOutcome, DeployError> {
        run.enter(DeployState::Stopping);
        match self.service.stop().await {
            Ok(message) => run.record("stop", true, message),
            // The service may simply not have been running.
            Err(error) => run.record("stop", false, error.to_string()),
        }

        run.enter(DeployState::Installing);
        let outcome = match self.installer.install(&run.source).await {
            Ok(outcome) => {
                let message = match &outcome.backup {
                    Some(backup) => format!(
                        "installed {} binary, previous saved to {}",
                        outcome.format,
                        backup.path.display()
                    ),
                    None => format!("installed {} binary", outcome.format),
                };
                run.record("install", true, message);
                outcome
            }
            Err(error) => {
                let error = DeployError::from(error);
                run.record("install", false, error.to_string());
                // Bring back whatever binary is still in place.
                match self.service.start().await {
                    Ok(message) => run.record("start", true, message),
                    Err(start_error) => run.record("start", false, start_error.to_string()),
                }
                return Err(error);
            }
        };

        run.enter(DeployState::Starting);
        match self.service.start().await {
            Ok(message) => run.record("start", true, message),
            Err(error) => {
                let error = DeployError::from(error);
                run.record("start", false, error.to_string());
                self.rollback(run, outcome.backup.as_ref()).await;
                return Err(error);
            }
        }

        run.enter(DeployState::Verifying);
        tokio::time::sleep(self.settle_delay).await;
        let error = match self.service.status().await {
            Ok(status) if status.active => {
                run.record_with_status("verify", true, "service is active", Some(status));
                return Ok(outcome);
            }
            Ok(status) => {
                let error = DeployError::VerificationFailed(format!(
                    "service is {} ({}) after {}s",
                    status.state,
                    status.substate,
                    self.settle_delay.as_secs_f32()
                ));
                run.record_with_status("verify", false, error.to_string(), Some(status));
                error
            }
            Err(query_error) => {
                let error = DeployError::VerificationFailed(query_error.to_string());
                run.record("verify", false, error.to_string());
                error
            }
        };
        self.rollback(run, outcome.backup.as_ref()).await;
        Err(error)
    }

    async fn rollback(&self, run: &mut DeployRun, backup: Option<&BackupEntry>) {
        if !self.restore_backup_on_failure {
            return;
        }
        let Some(backup) = backup else {
            run.record("rollback", false, "no backup from this attempt to restore");
            return;
        };
        if let Err(error) = self.installer.restore_backup(backup).await {
            run.record("rollback", false, error.to_string());
            return;
        }
        let stop_note = match self.service.stop().await {
            Ok(_) => String::new(),
            Err(error) => {
                tracing::warn!(%error, "stop before rollback restart failed");
                format!(" (stop failed: {error})")
            }
        };
        match self.service.start().await {
            Ok(_) => run.record(
                "rollback",
                true,
                format!("restored {} and restarted{stop_note}", backup.path.display()),
            ),
            Err(error) => run.record(
                "rollback",
                false,
                format!(
                    "restored {} but restart failed: {error}{stop_note}",
                    backup.path.display()
                ),
            ),
        }
    }

    async fn announce(&self, result: &DeployResult, outcome: Option<&InstallOutcome>) {
        // The holder of the lock reports its own outcome.
        if result.contended {
            return;
        }
        let notification = if result.success {
            let backup = outcome
                .and_then(|outcome| outcome.backup.as_ref())
                .map(|backup| backup.path.display().to_string())
                .unwrap_or_else(|| "none".to_string());
            Notification::new("Deployment succeeded", Severity::Success)
                .description(format!("`{}` is live", self.service.unit()))
                .field("Source", notify::truncate_chars(&result.source, 1024))
                .field("Backup", backup)
                .field("Duration", format!("{:.1}s", result.duration_ms as f64 / 1000.0))
        } else {
            Notification::new("Deployment failed", Severity::Error)
                .description(notify::truncate_chars(
                    result.error.as_deref().unwrap_or_default(),
                    2000,
                ))
                .field("Step", result.failed_step().unwrap_or("unknown"))
                .field("Source", notify::truncate_chars(&result.source, 1024))
        };
        notify::send_logged(self.notifier.as_ref(), notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notify::NotifyError,
        service::{ServiceStatus, ServiceStep},
    };
    use async_trait::async_trait;
    use axum::{Router, routing::get};
    use parking_lot::Mutex;
    use std::{
        fs,
        sync::atomic::{AtomicBool, Ordering},
    };
    use tempfile::{TempDir, tempdir};
    use tokio::net::TcpListener;

    #[derive(Debug, Default)]
    struct FakeService {
        calls: Mutex<Vec<&'static str>>,
        stop_fails: AtomicBool,
        start_fails: AtomicBool,
        inactive: AtomicBool,
        stop_delay: Duration,
    }

    #[async_trait]
    impl ServiceManager for FakeService {
        fn unit(&self) -> &str {
            "rtype-server"
        }

        async fn stop(&self) -> Result<String, ServiceError> {
            self.calls.lock().push("stop");
            tokio::time::sleep(self.stop_delay).await;
            if self.stop_fails.load(Ordering::SeqCst) {
                return Err(ServiceError::CommandFailed {
                    step: ServiceStep::Stop,
                    message: "unit not loaded".into(),
                });
            }
            Ok("Service stopped".into())
        }

        async fn start(&self) -> Result<String, ServiceError> {
            self.calls.lock().push("start");
            if self.start_fails.load(Ordering::SeqCst) {
                return Err(ServiceError::CommandFailed {
                    step: ServiceStep::Start,
                    message: "exit status 1".into(),
                });
            }
            Ok("Service started".into())
        }

        async fn restart(&self) -> Result<String, ServiceError> {
            self.calls.lock().push("restart");
            Ok("Service restarted".into())
        }

        async fn status(&self) -> Result<ServiceStatus, ServiceError> {
            let active = !self.inactive.load(Ordering::SeqCst);
            Ok(ServiceStatus {
                service: "rtype-server".into(),
                active,
                state: if active { "active" } else { "failed" }.into(),
                substate: if active { "running" } else { "dead" }.into(),
                pid: "4242".into(),
            })
        }
    }

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().push(notification.clone());
            Ok(())
        }
    }

    struct Harness {
        dir: TempDir,
        ctx: DeployContext,
        service: Arc<FakeService>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new(service: FakeService) -> Self {
            let dir = tempdir().unwrap();
            let service = Arc::new(service);
            let notifier = Arc::new(RecordingNotifier::default());
            let installer = BinaryInstaller::new(
                dir.path().join("server").join("rtype_server"),
                dir.path().join("backups"),
                5,
                Duration::from_secs(5),
            )
            .unwrap();
            let ctx = DeployContext::new(
                AdvisoryLock::new(dir.path().join("deploy.lock")),
                installer,
                service.clone(),
                notifier.clone(),
            )
            .with_settle_delay(Duration::ZERO);
            Self {
                dir,
                ctx,
                service,
                notifier,
            }
        }

        fn artifact(&self, name: &str, payload: &str) -> String {
            let path = self.dir.path().join(name);
            let mut bytes = b"\x7fELF".to_vec();
            bytes.extend_from_slice(payload.as_bytes());
            fs::write(&path, bytes).unwrap();
            path.display().to_string()
        }

        fn installed(&self) -> Vec<u8> {
            fs::read(self.ctx.installer().binary_path()).unwrap()
        }

        fn titles(&self) -> Vec<String> {
            self.notifier
                .sent
                .lock()
                .iter()
                .map(|notification| notification.title.clone())
                .collect()
        }
    }

    fn step_names(result: &DeployResult) -> Vec<&'static str> {
        result.steps.iter().map(|step| step.step).collect()
    }

    #[tokio::test]
    async fn successful_deploy_walks_every_step() {
        let harness = Harness::new(FakeService::default());
        let source = harness.artifact("v1", "one");

        let result = harness.ctx.deploy(&source).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.state, DeployState::Success);
        assert!(result.locked);
        assert_eq!(
            step_names(&result),
            ["lock", "stop", "install", "start", "verify"]
        );
        assert!(result.steps[4].status.as_ref().unwrap().active);
        assert_eq!(harness.installed(), b"\x7fELFone");
        assert_eq!(harness.titles(), ["Deployment succeeded"]);
        assert!(!harness.ctx.deploy_status().unwrap().in_progress);
    }

    #[tokio::test]
    async fn concurrent_deploys_admit_exactly_one() {
        let harness = Harness::new(FakeService {
            stop_delay: Duration::from_millis(200),
            ..FakeService::default()
        });
        let first = harness.artifact("a", "first");
        let second = harness.artifact("b", "second");

        let (a, b) = tokio::join!(harness.ctx.deploy(&first), harness.ctx.deploy(&second));

        let (winner, loser) = if a.locked { (a, b) } else { (b, a) };
        assert!(winner.success);
        assert!(!loser.success);
        assert!(!loser.locked);
        assert!(loser.contended);
        assert_eq!(loser.state, DeployState::Failed);
        assert_eq!(step_names(&loser), ["lock"]);
        let error = loser.error.unwrap();
        assert!(error.contains("InProgress"), "{error}");
        assert!(error.contains(&winner.source), "{error}");

        assert_eq!(
            harness.service.calls.lock().iter().filter(|c| **c == "stop").count(),
            1
        );
        assert_eq!(harness.titles(), ["Deployment succeeded"]);
    }

    #[tokio::test]
    async fn invalid_download_fails_and_keeps_current_binary() {
        let harness = Harness::new(FakeService::default());
        harness.ctx.deploy(&harness.artifact("v1", "one")).await;

        let app = Router::new().route("/bin", get(|| async { "<html>not found</html>" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let result = harness.ctx.deploy(&format!("http://{addr}/bin")).await;

        assert!(!result.success);
        assert_eq!(result.state, DeployState::Failed);
        assert!(result.locked);
        assert!(result.error.as_deref().unwrap().contains("not a valid"));
        assert_eq!(step_names(&result), ["lock", "stop", "install", "start"]);
        assert!(result.steps[3].success);
        assert_eq!(harness.installed(), b"\x7fELFone");
        assert_eq!(result.failed_step(), Some("install"));
        assert_eq!(
            harness.titles(),
            ["Deployment succeeded", "Deployment failed"]
        );
    }

    #[tokio::test]
    async fn stop_failure_is_not_fatal() {
        let harness = Harness::new(FakeService::default());
        harness.service.stop_fails.store(true, Ordering::SeqCst);

        let result = harness.ctx.deploy(&harness.artifact("v1", "one")).await;

        assert!(result.success);
        assert!(!result.steps[1].success);
        assert_eq!(result.steps[1].step, "stop");
    }

    #[tokio::test]
    async fn start_failure_ends_the_pipeline() {
        let harness = Harness::new(FakeService::default());
        harness.service.start_fails.store(true, Ordering::SeqCst);

        let result = harness.ctx.deploy(&harness.artifact("v1", "one")).await;

        assert!(!result.success);
        assert_eq!(step_names(&result), ["lock", "stop", "install", "start"]);
        assert!(result.error.unwrap().starts_with("service command failed"));
    }

    #[tokio::test]
    async fn inactive_service_fails_verification() {
        let harness = Harness::new(FakeService::default());
        harness.service.inactive.store(true, Ordering::SeqCst);

        let result = harness.ctx.deploy(&harness.artifact("v1", "one")).await;

        assert!(!result.success);
        assert_eq!(result.failed_step(), Some("verify"));
        assert!(result.error.unwrap().contains("verification failed"));
        assert!(!harness.ctx.deploy_status().unwrap().in_progress);
        assert_eq!(harness.titles(), ["Deployment failed"]);
    }

    #[tokio::test]
    async fn failed_verification_restores_backup_when_enabled() {
        let mut harness = Harness::new(FakeService::default());
        harness.ctx = harness.ctx.clone().with_restore_backup_on_failure(true);
        harness.ctx.deploy(&harness.artifact("v1", "one")).await;
        harness.service.inactive.store(true, Ordering::SeqCst);

        let result = harness.ctx.deploy(&harness.artifact("v2", "two")).await;

        assert!(!result.success);
        assert_eq!(
            step_names(&result),
            ["lock", "stop", "install", "start", "verify", "rollback"]
        );
        assert!(result.steps[5].success);
        assert_eq!(harness.installed(), b"\x7fELFone");
    }

    #[tokio::test]
    async fn failed_verification_keeps_new_binary_by_default() {
        let harness = Harness::new(FakeService::default());
        harness.ctx.deploy(&harness.artifact("v1", "one")).await;
        harness.service.inactive.store(true, Ordering::SeqCst);

        let result = harness.ctx.deploy(&harness.artifact("v2", "two")).await;

        assert!(!result.success);
        assert!(!step_names(&result).contains(&"rollback"));
        assert_eq!(harness.installed(), b"\x7fELFtwo");
    }

    #[tokio::test]
    async fn abandoned_deploy_still_restarts_the_service() {
        let harness = Harness::new(FakeService {
            stop_delay: Duration::from_millis(200),
            ..FakeService::default()
        });
        let source = harness.artifact("v1", "one");

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), harness.ctx.deploy(&source)).await;
        assert!(abandoned.is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.titles().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*harness.service.calls.lock(), ["stop", "start"]);
        assert_eq!(harness.installed(), b"\x7fELFone");
        assert_eq!(harness.titles(), ["Deployment succeeded"]);
        assert!(!harness.ctx.deploy_status().unwrap().in_progress);
    }

    #[tokio::test]
    async fn unusable_lock_file_fails_and_notifies() {
        let mut harness = Harness::new(FakeService::default());
        let blocker = harness.dir.path().join("locks");
        fs::write(&blocker, b"not a directory").unwrap();
        harness.ctx.lock = AdvisoryLock::new(blocker.join("deploy.lock"));

        let result = harness.ctx.deploy(&harness.artifact("v1", "one")).await;

        assert!(!result.success);
        assert!(!result.locked);
        assert!(!result.contended);
        assert_eq!(step_names(&result), ["lock"]);
        assert!(result.error.unwrap().starts_with("deploy lock unavailable"));
        assert!(harness.service.calls.lock().is_empty());
        assert_eq!(harness.titles(), ["Deployment failed"]);
    }

    #[tokio::test]
    async fn rollback_reports_a_failed_stop() {
        let mut harness = Harness::new(FakeService::default());
        harness.ctx = harness.ctx.clone().with_restore_backup_on_failure(true);
        harness.ctx.deploy(&harness.artifact("v1", "one")).await;
        harness.service.inactive.store(true, Ordering::SeqCst);
        harness.service.stop_fails.store(true, Ordering::SeqCst);

        let result = harness.ctx.deploy(&harness.artifact("v2", "two")).await;

        let rollback = result.steps.last().unwrap();
        assert_eq!(rollback.step, "rollback");
        assert!(rollback.success);
        assert!(rollback.message.contains("stop failed"), "{}", rollback.message);
        assert!(rollback.message.contains("unit not loaded"), "{}", rollback.message);
        assert_eq!(harness.installed(), b"\x7fELFone");
    }

    #[tokio::test]
    async fn leftover_lock_record_is_cleared_on_startup() {
        let harness = Harness::new(FakeService::default());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let record = crate::lock::LockRecord {
            holder_pid: dead_pid,
            started_at: chrono::Utc::now(),
            subject: "interrupted deploy".to_string(),
        };
        fs::write(
            harness.dir.path().join("deploy.lock"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        assert!(harness.ctx.deploy_status().unwrap().stale);

        assert!(harness.ctx.clear_stale_lock().unwrap());

        let status = harness.ctx.deploy_status().unwrap();
        assert!(!status.stale);
        assert!(status.record.is_none());
        assert!(!harness.ctx.clear_stale_lock().unwrap());
    }
}
