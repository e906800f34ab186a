mod cli;
mod config;
mod deploy;
mod env;
mod installer;
mod lock;
mod logging;
mod notify;
mod paths;
mod server;
mod service;
mod shutdown;
mod state;
mod supervisor;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    logging::init_tracing();
    let cli = cli::Cli::parse();
    cli.execute().await
}
