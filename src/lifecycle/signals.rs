//! OS signal handling.
//!
//! SIGINT and SIGTERM both start a graceful shutdown. A second signal while
//! draining exits the process immediately.

use std::io;

use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::Shutdown;

/// Resolve with the name of the first termination signal received.
pub async fn wait_for_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}

/// Trigger `shutdown` on the first signal; force exit on the second.
pub fn spawn_signal_handler(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => tracing::info!(signal = name, "shutdown signal received"),
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handlers");
                return;
            }
        }
        shutdown.trigger();

        if let Ok(name) = wait_for_signal().await {
            tracing::warn!(signal = name, "second signal, exiting without draining");
            std::process::exit(130);
        }
    })
}
