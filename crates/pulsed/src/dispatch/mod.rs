//! Bounded-concurrency dispatch of inbound TCP connections and UDP datagrams.
//!
//! Each accepted connection or received datagram is one dispatch unit. A unit
//! is admitted only if a [`Slot`] is free; otherwise it is shed immediately
//! (stream closed, datagram dropped) and the receive loop moves on. An
//! admitted unit owns its slot until the worker task finishes, panics or is
//! cancelled.

pub mod tcp;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub use tcp::{Connection, TcpDispatcher};
pub use udp::{Datagram, UdpDispatcher};

// ── Admission control ─────────────────────────────────────────────────────────

/// Shared in-flight ceiling for one dispatcher.
#[derive(Debug, Clone)]
pub struct Admission {
    permits: Arc<Semaphore>,
    max: usize,
}

impl Admission {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max: max_concurrent,
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn try_admit(&self) -> Option<Slot> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Units currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max - self.permits.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max
    }
}

/// One admitted unit's share of the ceiling. Released on drop.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

// ── Socket setup ──────────────────────────────────────────────────────────────

/// Candidate local addresses for `host`. Empty means any address, IPv6
/// first so a dual-stack socket is preferred.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if host.is_empty() {
        return Ok(vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ]);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve bind host {host:?}"))?
        .collect();
    if addrs.is_empty() {
        bail!("bind host {host:?} resolved to no addresses");
    }
    Ok(addrs)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Stream { backlog: i32 },
    Datagram,
}

fn make_socket(addr: &SocketAddr, kind: Kind) -> Result<Socket> {
    let domain = Domain::for_address(*addr);
    let socket = match kind {
        Kind::Stream { .. } => Socket::new(domain, Type::STREAM, Some(Protocol::TCP)),
        Kind::Datagram => Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)),
    }
    .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if addr.is_ipv6() {
        // Best effort: some hosts force IPV6_V6ONLY.
        if let Err(e) = socket.set_only_v6(false) {
            tracing::debug!(error = %e, "dual-stack socket unavailable");
        }
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&(*addr).into()).context("bind()")?;
    if let Kind::Stream { backlog } = kind {
        socket.listen(backlog).context("listen()")?;
    }
    Ok(socket)
}

/// Bind the first candidate that works.
pub(crate) fn bind_first(addrs: &[SocketAddr], kind: Kind) -> Result<Socket> {
    for addr in addrs {
        match make_socket(addr, kind) {
            Ok(socket) => return Ok(socket),
            Err(e) => tracing::warn!(addr = %addr, error = %e, "bind attempt failed"),
        }
    }
    bail!("no usable address among {addrs:?}")
}
