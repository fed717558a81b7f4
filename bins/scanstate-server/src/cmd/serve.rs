use std::time::Duration;

use tokio::net::TcpListener;

use scanstate_engine::{Supervisor, open_source, open_store};

use crate::config::ServeArgs;
use crate::error::ServerError;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("scanstate-server starting");
    let config = args.common.resolve()?;

    // --- Inspection API listener (port 0 disables it) ---
    let api_listener = match config.api.port {
        0 => None,
        port => Some(
            TcpListener::bind(("0.0.0.0", port))
                .await
                .map_err(|e| ServerError::Api(format!("bind :{port}: {e}")))?,
        ),
    };

    // --- Store, then source ---
    let store = open_store(&config.store).await?;
    let source = match open_source(&config.source).await {
        Ok(source) => source,
        Err(e) => {
            super::close_store(&*store).await;
            return Err(e.into());
        }
    };

    // --- Workers ---
    let mut supervisor = Supervisor::start(config.worker.supervisor_settings(), store.clone(), source);

    // --- Inspection API ---
    let api_handle = api_listener.map(|listener| {
        tokio::spawn(scanstate_api_server::serve(listener, store.clone(), supervisor.token()))
    });

    tracing::info!("server ready");

    // --- Signal or worker failure ---
    let outcome = supervisor.run_until(shutdown_signal()).await;
    tracing::info!("shutting down...");

    let result = supervisor.shutdown().await;

    if let Some(handle) = api_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "api server error"),
            Ok(Err(e)) => tracing::error!(error = %e, "api server task failed"),
            Err(_) => tracing::warn!("api server did not stop in time"),
        }
    }

    outcome?;
    let stats = result?;
    tracing::info!(
        received = stats.received,
        applied = stats.applied,
        skipped = stats.skipped,
        decode_failures = stats.decode_failures,
        store_failures = stats.store_failures,
        settle_failures = stats.settle_failures,
        "shutdown complete"
    );
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl+c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
