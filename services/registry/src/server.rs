//! Running the registry as a process: HTTP listener plus daemons, stopped
//! together on a signal.

use std::future::IntoFuture;

use eyre::WrapErr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::app::App;

/// Bind `http.internalEndpoint` and serve until `shutdown` fires.
pub async fn serve(app: App, shutdown: CancellationToken) -> eyre::Result<()> {
    let addr = app.config().http.bind_address()?;
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("bind {addr}"))?;
    serve_on(app, listener, shutdown).await
}

/// Serve on an already bound listener.
///
/// Once `shutdown` fires, open connections and running jobs each get
/// `http.shutdownTimeout` to finish before they are dropped.
pub async fn serve_on(app: App, listener: TcpListener, shutdown: CancellationToken) -> eyre::Result<()> {
    let grace = app.config().http.shutdown_timeout;
    let mut daemons = app.start_daemons(shutdown.clone());
    tracing::info!(addr = %listener.local_addr()?, "registry listening");

    let server = axum::serve(listener, app.router())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    let served = tokio::select! {
        result = server => result.wrap_err("http server"),
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(?grace, "connections still open after the shutdown timeout");
            Ok(())
        }
    };
    shutdown.cancel();

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = daemons.join_next().await {
            if let Err(error) = joined {
                tracing::error!(%error, "daemon task panicked");
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(?grace, "daemons still running after the shutdown timeout");
        daemons.shutdown().await;
    }
    tracing::info!("registry stopped");
    served
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
pub fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(%error, "cannot listen for ctrl-c");
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
                Err(error) => {
                    tracing::warn!(%error, "cannot listen for SIGTERM");
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
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });
}
