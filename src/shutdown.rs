use std::io;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Returns a token cancelled on the first SIGTERM or SIGINT. Later signals
/// are logged and otherwise ignored so an in-flight shutdown runs to the end.
pub fn install_signal_handlers() -> io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigint.recv() => "SIGINT",
                else => break,
            };
            if trigger.is_cancelled() {
                tracing::info!(signal = name, "shutdown already in progress");
                continue;
            }
            tracing::info!(signal = name, "received signal, shutting down");
            trigger.cancel();
        }
    });

    Ok(token)
}
