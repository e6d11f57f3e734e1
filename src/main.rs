use anyhow::Context;
use control_plane::{
    config::ControlPlaneConfig, metrics::MetricsService, observability::init_tracing, ControlPlane,
};
use std::env;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/control-plane.yaml".to_string());

    let config = ControlPlaneConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    init_tracing(&config.logging).context("failed to initialize tracing")?;

    let metrics = MetricsService::new().context("failed to install metrics exporter")?;
    let control_plane = ControlPlane::build(config)
        .await
        .context("failed to build control plane")?
        .with_metrics(metrics);

    control_plane.start().await;

    let result = control_plane.serve(shutdown_signal()).await;
    control_plane.shutdown();

    result.context("admin server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
