//! Shutdown signal handling

use tracing::warn;

/// Resolves once SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives.
///
/// Returns the name of the signal so the caller can log it. systemd stops
/// units with SIGTERM, so both must end the poll loop cleanly.
pub async fn wait_for_shutdown() -> &'static str {
    wait_signal().await
}

#[cfg(unix)]
async fn wait_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            }
        },
        Err(e) => {
            warn!("SIGTERM handler unavailable ({e}), waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        },
    }
}

#[cfg(not(unix))]
async fn wait_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler failed: {e}");
    }
    "SIGINT"
}
