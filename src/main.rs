use anyhow::Context;
use tracing::{error, info};

use qsorelay::{
    backlog::open_backlog,
    config::RelayConfig,
    delivery::qrz::QrzClient,
    runtime::{
        handle::{RuntimeError, spawn_relay},
        listener::{bind, run_listener},
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qsorelay=info".into()),
        )
        .init();

    let config = RelayConfig::from_env()?;
    if config.offline {
        info!("offline mode: records are stored but not uploaded");
    }

    let backlog = open_backlog(config.backlog_kind, &config.backlog_path).with_context(|| {
        format!(
            "failed to open {} backlog at {}",
            config.backlog_kind,
            config.backlog_path.display()
        )
    })?;

    let socket = bind(&config.listen_addr())
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr()))?;

    let client = QrzClient::new(config.client_config()).context("failed to build HTTP client")?;
    let handle = spawn_relay(backlog, client, config.runtime_config()).await?;

    tokio::select! {
        res = run_listener(socket, config.forward_to, handle.clone()) => {
            match res {
                Err(RuntimeError::ChannelClosed) | Ok(()) => error!("relay stopped unexpectedly"),
                Err(err) => return Err(err.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, finishing queued records");
        }
    }

    handle.shutdown().await?;
    Ok(())
}
