use super::*;
use std::{path::Path, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use reqwest::Method;
use serde_json::{Value, json};

use crate::{
    config::{self, Config},
    deploy::DeployContext,
    notify, server,
    service::Systemctl,
    shutdown,
    state::StateStore,
    supervisor::{Supervisor, session},
};

fn load_config(path: &Path) -> Result<Config> {
    let config = config::load_or_default(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

pub async fn serve(config_path: &Path, args: ServeArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(listen) = args.listen {
        config.deploy.listen = listen;
    }

    let service = Arc::new(Systemctl::new(
        config.server.service_name.clone(),
        config.service.clone(),
    ));
    let notifier = notify::from_config(&config.notify);
    let ctx = DeployContext::from_config(&config, service, notifier)
        .context("preparing deploy pipeline")?;
    if let Err(error) = ctx.clear_stale_lock() {
        tracing::warn!(%error, "could not clear stale deploy lock");
    }
    let state = server::AppState::new(ctx, StateStore::new(&config.supervisor.state_file));

    let shutdown = shutdown::install_signal_handlers().context("installing signal handlers")?;
    server::serve(config.deploy.listen, state, shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

pub async fn supervise(config_path: &Path, args: SuperviseArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(path) = args.server_path {
        config.server.binary_path = path;
    }
    if let Some(kind) = args.session {
        config.supervisor.session = kind.into();
    }

    let shutdown = shutdown::install_signal_handlers().context("installing signal handlers")?;
    let backend = session::from_config(&config.supervisor);
    let notifier = notify::from_config(&config.notify);
    let code = Supervisor::new(&config, backend, notifier, shutdown)
        .run()
        .await?;
    Ok(exit_code(code))
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code)
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}

pub async fn deploy(config_path: &Path, args: DeployArgs) -> Result<ExitCode> {
    let client = ControlClient::new(config_path, &args.client, Duration::from_secs(900))?;
    let body = client
        .send(Method::POST, "/deploy", Some(json!({ "source": args.source })))
        .await?;
    Ok(report(&body))
}

pub async fn status(config_path: &Path, args: ClientArgs) -> Result<ExitCode> {
    simple_request(config_path, &args, Method::GET, "/status").await
}

pub async fn deploy_status(config_path: &Path, args: ClientArgs) -> Result<ExitCode> {
    simple_request(config_path, &args, Method::GET, "/deploy/status").await
}

pub async fn restart(config_path: &Path, args: ClientArgs) -> Result<ExitCode> {
    simple_request(config_path, &args, Method::POST, "/restart").await
}

pub async fn start(config_path: &Path, args: ClientArgs) -> Result<ExitCode> {
    simple_request(config_path, &args, Method::POST, "/start").await
}

pub async fn stop(config_path: &Path, args: ClientArgs) -> Result<ExitCode> {
    simple_request(config_path, &args, Method::POST, "/stop").await
}

async fn simple_request(
    config_path: &Path,
    args: &ClientArgs,
    method: Method,
    path: &str,
) -> Result<ExitCode> {
    let client = ControlClient::new(config_path, args, Duration::from_secs(90))?;
    let body = client.send(method, path, None).await?;
    Ok(report(&body))
}

fn report(body: &Value) -> ExitCode {
    match serde_json::to_string_pretty(body) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{body}"),
    }
    if body["success"].as_bool().unwrap_or(false) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub fn completions(args: CompletionsArgs) -> Result<ExitCode> {
    use clap::CommandFactory;
    let mut cmd = crate::cli::Cli::command();
    let shell: Shell = args.shell.into();
    clap_complete::generate(shell, &mut cmd, "rtype-ops", &mut std::io::stdout());
    Ok(ExitCode::SUCCESS)
}

struct ControlClient {
    http: reqwest::Client,
    base: String,
}

impl ControlClient {
    fn new(config_path: &Path, args: &ClientArgs, timeout: Duration) -> Result<Self> {
        let base = match &args.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => load_config(config_path)?.deploy.endpoint(),
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// Error statuses still carry a JSON body worth printing; only transport
    /// failures and non-JSON replies are errors here.
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{path}", self.base);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("contacting deploy service at {url}"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("reading response from {url}"))?;
        serde_json::from_str(&text)
            .map_err(|error| anyhow!("unexpected response from {url} ({status}): {error}: {text}"))
    }
}
