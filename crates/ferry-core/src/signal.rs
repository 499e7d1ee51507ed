//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
///
/// If a handler cannot be installed the function only waits for Ctrl-C.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) = handlers else {
        let _ = tokio::signal::ctrl_c().await;
        info!(message = "Signal received.", signal = "ctrl-c");
        return;
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

/// Wait for Ctrl-C on platforms without Unix signals.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(message = "Signal received.", signal = "ctrl-c");
}

/// Cancel `token` when a shutdown signal arrives.
///
/// The watcher stops on its own once the token is canceled by someone else.
pub fn cancel_on_shutdown(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_watcher_exits_when_token_canceled_elsewhere() {
        let token = CancellationToken::new();
        let watcher = cancel_on_shutdown(token.clone());

        token.cancel();

        tokio::time::timeout(Duration::from_millis(500), watcher)
            .await
            .expect("watcher should stop quickly")
            .expect("watcher should not panic");
    }

    #[tokio::test]
    async fn test_cancellation_propagates_through_clones() {
        let original = CancellationToken::new();
        let for_monitor = original.clone();
        let for_watcher = for_monitor.clone();

        original.cancel();

        assert!(for_monitor.is_cancelled());
        assert!(for_watcher.is_cancelled());
    }
}
