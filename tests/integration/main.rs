//! Pulse integration test harness.
//!
//! Every test runs a real dispatcher on loopback (`127.0.0.1:0`), so tests
//! need no privileges and never collide on ports. Every await that could
//! hang is wrapped in a timeout.
//!
//!   cargo test --test integration

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use pulse_core::config::{DispatchConfig, RegistryConfig};
use pulse_core::registry::ClockMode;
use pulsed::dispatch::{Admission, Connection, Datagram, TcpDispatcher, UdpDispatcher};
use pulsed::heartbeat::{self, PeerRegistry};

mod admission;
mod liveness;
mod registry;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for any single network step.
pub const WAIT: Duration = Duration::from_secs(5);

/// A dispatcher running in the background until [`Server::stop`].
pub struct Server {
    pub addr: SocketAddr,
    pub admission: Admission,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Server {
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(WAIT, self.task).await??
    }
}

pub fn dispatch_config(max_concurrent: usize) -> DispatchConfig {
    DispatchConfig {
        max_concurrent,
        ..DispatchConfig::default()
    }
}

pub async fn start_tcp<H, Fut>(config: DispatchConfig, handler: H) -> Result<Server>
where
    H: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let dispatcher = TcpDispatcher::bind("127.0.0.1", 0, &config).await?;
    let addr = dispatcher.local_addr()?;
    let admission = dispatcher.admission();
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(dispatcher.run(handler, rx));
    Ok(Server {
        addr,
        admission,
        shutdown,
        task,
    })
}

pub async fn start_udp<H, Fut>(config: DispatchConfig, handler: H) -> Result<Server>
where
    H: Fn(Datagram) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let dispatcher = UdpDispatcher::bind("127.0.0.1", 0, &config).await?;
    let addr = dispatcher.local_addr()?;
    let admission = dispatcher.admission();
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(dispatcher.run(handler, rx));
    Ok(Server {
        addr,
        admission,
        shutdown,
        task,
    })
}

/// Peer registry ticked by hand.
pub fn manual_peer_registry(interval_ticks: u32) -> PeerRegistry {
    let config = RegistryConfig {
        interval_ticks,
        ..RegistryConfig::default()
    };
    heartbeat::registry_builder(&config)
        .clock(ClockMode::Manual)
        .build()
        .expect("valid registry config")
}

/// Poll `check` every 10ms until it holds or `WAIT` runs out.
pub async fn wait_for_condition(mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {WAIT:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
