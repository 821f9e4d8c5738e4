use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received, or right away if the handlers cannot be installed.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let signals = signal(SignalKind::terminate())
            .and_then(|term| signal(SignalKind::interrupt()).map(|int| (term, int)));
        let (mut sigterm, mut sigint) = match signals {
            Ok(signals) => signals,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers, shutting down");
                trigger.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping workers");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping workers");
            }
        }

        trigger.cancel();
    });

    token
}
