//! tapfd-server - privileged daemon serving tap device descriptors
//!
//! Usage: `tapfd-server [SOCKET_PATH]`
//!
//! The socket path argument overrides `TAPFD_SOCKET`. Runs until SIGINT or
//! SIGTERM, then stops the server, which closes every tap it still holds.

use std::env;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};

use tapfd::metrics;
use tapfd::tracing::{init_tracing, shutdown_tracing};
use tapfd::{DaemonConfig, FdServer, TapFdSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = DaemonConfig::from_env();
    if let Some(path) = env::args().nth(1) {
        config.server.socket_path = path.into();
    }

    init_tracing("tapfd-server", config.otlp_endpoint.as_deref())?;

    let mut server = FdServer::with_config(config.server, TapFdSource::new());
    if let Err(e) = server.serve().await {
        error!(error = %e, socket = %server.socket_path().display(), "failed to start fd server");
        shutdown_tracing();
        return Err(e.into());
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    let result = server.stop().await;
    if let Err(e) = &result {
        error!(error = %e, "fd source failed to stop cleanly");
    }
    debug!(metrics = %metrics::render(), "final metrics");

    shutdown_tracing();
    result.map_err(Into::into)
}
