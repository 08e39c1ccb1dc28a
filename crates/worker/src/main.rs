use tokio::sync::watch;

use forgejobs_infra::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgejobs_observability::init();

    let config = EngineConfig::from_env()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
        }
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    forgejobs_worker::runtime::run(config, shutdown_rx).await
}
