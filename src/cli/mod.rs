use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum, builder::PossibleValue};
use clap_complete::Shell;
use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use crate::{config::SessionKind, paths};

#[derive(Parser, Debug)]
#[command(
    name = "rtype-ops",
    version,
    about = "Deployment service and process supervisor for the R-Type server"
)]
pub struct Cli {
    /// Configuration file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = paths::CONFIG_PATH_VAR,
        default_value = paths::DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub async fn execute(self) -> Result<ExitCode> {
        let config = self.config;
        match self.command {
            Command::Serve(args) => handlers::serve(&config, args).await,
            Command::Supervise(args) => handlers::supervise(&config, args).await,
            Command::Deploy(args) => handlers::deploy(&config, args).await,
            Command::Status(args) => handlers::status(&config, args).await,
            Command::DeployStatus(args) => handlers::deploy_status(&config, args).await,
            Command::Restart(args) => handlers::restart(&config, args).await,
            Command::Start(args) => handlers::start(&config, args).await,
            Command::Stop(args) => handlers::stop(&config, args).await,
            Command::Completions(args) => handlers::completions(args),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP deploy service
    Serve(ServeArgs),
    /// Run and supervise the game server
    Supervise(SuperviseArgs),
    /// Deploy a binary from a URL or local path
    Deploy(DeployArgs),
    /// Show service, supervisor and backup status
    Status(ClientArgs),
    /// Show whether a deployment is in progress
    DeployStatus(ClientArgs),
    /// Restart the managed service
    Restart(ClientArgs),
    /// Start the managed service
    Start(ClientArgs),
    /// Stop the managed service
    Stop(ClientArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to listen on (overrides deploy.listen)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,
}

#[derive(Args, Debug, Default)]
pub struct SuperviseArgs {
    /// Server executable (overrides server.binary_path)
    #[arg(long = "server-path", value_name = "PATH")]
    pub server_path: Option<PathBuf>,

    /// Session backend (overrides supervisor.session)
    #[arg(long, value_enum)]
    pub session: Option<SessionArg>,
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Deploy service base URL (defaults to the configured listen address)
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Artifact URL or local path
    pub source: String,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: CompletionShell,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum SessionArg {
    Tmux,
    Direct,
}

impl From<SessionArg> for SessionKind {
    fn from(arg: SessionArg) -> Self {
        match arg {
            SessionArg::Tmux => SessionKind::Tmux,
            SessionArg::Direct => SessionKind::Direct,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl ValueEnum for CompletionShell {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            CompletionShell::Bash,
            CompletionShell::Zsh,
            CompletionShell::Fish,
            CompletionShell::PowerShell,
            CompletionShell::Elvish,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        Some(match self {
            CompletionShell::Bash => PossibleValue::new("bash"),
            CompletionShell::Zsh => PossibleValue::new("zsh"),
            CompletionShell::Fish => PossibleValue::new("fish"),
            CompletionShell::PowerShell => PossibleValue::new("powershell"),
            CompletionShell::Elvish => PossibleValue::new("elvish"),
        })
    }
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

mod handlers;

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_deploy_with_endpoint() {
        let cli = Cli::try_parse_from([
            "rtype-ops",
            "--config",
            "/tmp/ops.toml",
            "deploy",
            "https://ci.example/rtype_server",
            "--endpoint",
            "http://10.0.0.2:8080",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/ops.toml"));
        let Command::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.source, "https://ci.example/rtype_server");
        assert_eq!(args.client.endpoint.as_deref(), Some("http://10.0.0.2:8080"));
    }

    #[test]
    fn parses_supervise_overrides() {
        let cli = Cli::try_parse_from([
            "rtype-ops",
            "supervise",
            "--server-path",
            "/srv/rtype_server",
            "--session",
            "direct",
        ])
        .unwrap();
        let Command::Supervise(args) = cli.command else {
            panic!("expected supervise");
        };
        assert_eq!(args.session.map(SessionKind::from), Some(SessionKind::Direct));
        assert_eq!(args.server_path, Some(PathBuf::from("/srv/rtype_server")));
    }
}
