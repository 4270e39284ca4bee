//! Peer liveness over the dispatchers.
//!
//! A peer announces itself by name, either as a stream of netstrings on TCP
//! (ended by the empty netstring `0:,` or by closing) or as one UDP datagram
//! per heartbeat. Each heartbeat refreshes the peer's TTL; peers that go
//! quiet for a full TTL expire from the registry.

use std::fmt;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;

use pulse_core::addr;
use pulse_core::config::RegistryConfig;
use pulse_core::registry::{ClockMode, ExpiryMode, RegistryBuilder};
use pulse_core::{Registry, RegistryError, Update};

use crate::dispatch::{Connection, Datagram};

/// Longest accepted peer name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

pub const REPLY_NEW: &[u8] = b"new";
pub const REPLY_SEEN: &[u8] = b"seen";
pub const REPLY_BAD: &[u8] = b"bad";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// What the registry remembers about a peer. Fixed at first sighting;
/// later heartbeats only refresh the TTL.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub transport: Transport,
    pub first_seen: Instant,
}

pub type PeerRegistry = Registry<String, PeerRecord>;

/// Builder preconfigured from `config`, logging every expiry.
pub fn registry_builder(config: &RegistryConfig) -> RegistryBuilder<String, PeerRecord> {
    let mode = if config.deferred_expiry {
        ExpiryMode::Deferred
    } else {
        ExpiryMode::Synchronous
    };
    Registry::builder(config.resolution(), config.interval_ticks)
        .buckets(config.buckets)
        .expiry_mode(mode)
        .on_expire(|name: &String, peer: &PeerRecord| {
            tracing::info!(
                peer = %name,
                addr = %peer.addr,
                transport = %peer.transport,
                alive_secs = peer.first_seen.elapsed().as_secs(),
                "peer expired"
            );
        })
}

/// Peer registry driven by its own clock thread.
pub fn new_registry(config: &RegistryConfig) -> Result<PeerRegistry, RegistryError> {
    registry_builder(config).clock(ClockMode::Thread).build()
}

/// Validate a heartbeat payload as a peer name.
pub fn peer_name(payload: &[u8]) -> Option<String> {
    let name = std::str::from_utf8(payload).ok()?.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return None;
    }
    Some(name.to_string())
}

/// Record one heartbeat.
pub fn record(registry: &PeerRegistry, name: String, peer: SocketAddr, transport: Transport) -> Update {
    let record = PeerRecord {
        addr: addr::canonical(peer),
        transport,
        first_seen: Instant::now(),
    };
    let outcome = registry.update(name.clone(), record);
    match outcome {
        Update::Created => {
            tracing::info!(peer = %name, addr = %addr::canonical(peer), %transport, "peer joined")
        }
        Update::Refreshed => tracing::trace!(peer = %name, "peer refreshed"),
    }
    outcome
}

/// TCP worker: one heartbeat per netstring, until `0:,` or EOF. Replies
/// `new`, `seen` or `bad` to each.
pub async fn serve_connection(registry: PeerRegistry, mut conn: Connection) -> Result<()> {
    let peer = conn.peer();
    let mut beats = 0usize;
    while let Some(payload) = conn.read_netstring(MAX_NAME_LEN).await? {
        if payload.is_empty() {
            break;
        }
        let reply = match peer_name(&payload) {
            Some(name) => match record(&registry, name, peer, Transport::Tcp) {
                Update::Created => REPLY_NEW,
                Update::Refreshed => REPLY_SEEN,
            },
            None => {
                tracing::debug!(peer = %peer, payload = hex::encode(&payload), "malformed heartbeat");
                REPLY_BAD
            }
        };
        conn.send_netstring(reply).await?;
        beats += 1;
    }
    tracing::debug!(peer = %peer, beats, "heartbeat stream closed");
    Ok(())
}

/// UDP worker: the whole datagram is one heartbeat. No reply.
pub async fn serve_datagram(registry: PeerRegistry, datagram: Datagram) -> Result<()> {
    match peer_name(datagram.payload()) {
        Some(name) => {
            record(&registry, name, datagram.peer(), Transport::Udp);
        }
        None if datagram.is_empty() => {}
        None => tracing::debug!(
            peer = %datagram.peer(),
            payload = hex::encode(datagram.payload()),
            "malformed heartbeat"
        ),
    }
    Ok(())
}

/// Periodically log the registry's size and contents until shutdown.
pub async fn snapshot_loop(
    registry: PeerRegistry,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }
        // Copy out under the lock, log after.
        let mut peers = Vec::new();
        registry.for_each(|name, record| {
            peers.push((name.clone(), record.addr, record.transport));
            ControlFlow::Continue(())
        });
        tracing::info!(count = peers.len(), "peer registry snapshot");
        for (name, addr, transport) in peers {
            tracing::info!(peer = %name, %addr, %transport, "  peer");
        }
    }
}
