//! pulsed — peer liveness daemon.
//!
//! Usage: `pulsed [CONFIG_PATH]`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use pulse_core::config::PulseConfig;
use pulsed::daemon;
use pulsed::dispatch::{TcpDispatcher, UdpDispatcher};
use pulsed::heartbeat;

const SNAPSHOT_EVERY: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            PulseConfig::load_from(path).context("failed to load config")?
        }
        None => {
            if let Err(e) = PulseConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            PulseConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                PulseConfig::default()
            })
        }
    };

    // Fork before any thread exists.
    if config.daemon.detach {
        daemon::daemonize(config.daemon.log_file.as_deref())?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(config))
}

async fn run(config: PulseConfig) -> Result<()> {
    tracing::info!(
        bind_host = %config.network.bind_host,
        tcp_port = config.network.tcp_port,
        udp_port = config.network.udp_port,
        ttl_secs = config.registry.ttl().as_secs(),
        "pulsed starting"
    );

    let registry = heartbeat::new_registry(&config.registry).context("failed to create registry")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let mut tasks = Vec::new();

    if config.network.tcp_enabled {
        let dispatcher = TcpDispatcher::bind(
            &config.network.bind_host,
            config.network.tcp_port,
            &config.dispatch,
        )
        .await
        .context("failed to start tcp dispatcher")?;
        let registry = registry.clone();
        tasks.push(tokio::spawn(dispatcher.run(
            move |conn| heartbeat::serve_connection(registry.clone(), conn),
            shutdown_tx.subscribe(),
        )));
    }

    if config.network.udp_enabled {
        let dispatcher = UdpDispatcher::bind(
            &config.network.bind_host,
            config.network.udp_port,
            &config.dispatch,
        )
        .await
        .context("failed to start udp dispatcher")?;
        let registry = registry.clone();
        tasks.push(tokio::spawn(dispatcher.run(
            move |datagram| heartbeat::serve_datagram(registry.clone(), datagram),
            shutdown_tx.subscribe(),
        )));
    }

    let snapshot_task = tokio::spawn(heartbeat::snapshot_loop(
        registry.clone(),
        SNAPSHOT_EVERY,
        shutdown_tx.subscribe(),
    ));

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "dispatcher failed"),
            Err(e) => tracing::error!(error = %e, "dispatcher task panicked"),
        }
    }
    snapshot_task.await.ok();

    registry.clear();
    tracing::info!("pulsed stopped");
    Ok(())
}
