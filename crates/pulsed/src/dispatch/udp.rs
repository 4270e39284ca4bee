//! Datagram receive loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use pulse_core::config::DispatchConfig;

use super::{bind_first, resolve, Admission, Kind, Slot};

pub struct UdpDispatcher {
    socket: UdpSocket,
    admission: Admission,
    max_datagram: usize,
}

impl UdpDispatcher {
    pub async fn bind(host: &str, port: u16, config: &DispatchConfig) -> Result<Self> {
        let addrs = resolve(host, port).await?;
        let socket = bind_first(&addrs, Kind::Datagram)?;
        let socket = UdpSocket::from_std(socket.into())
            .context("failed to register UDP socket with the runtime")?;

        Ok(Self {
            socket,
            admission: Admission::new(config.max_concurrent),
            max_datagram: config.max_datagram,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn admission(&self) -> Admission {
        self.admission.clone()
    }

    /// Receive until `shutdown` fires. Datagrams arriving while every slot
    /// is taken are dropped.
    pub async fn run<H, Fut>(self, handler: H, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        H: Fn(Datagram) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let local = self.socket.local_addr().ok();
        let mut buf = vec![0u8; self.max_datagram];

        tracing::info!(
            addr = ?local,
            max_concurrent = self.admission.max_concurrent(),
            max_datagram = self.max_datagram,
            "udp dispatcher listening"
        );

        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(addr = ?local, "udp dispatcher stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                }
            };

            let Some(slot) = self.admission.try_admit() else {
                tracing::warn!(peer = %peer, len, "at capacity, discarding datagram");
                continue;
            };

            tracing::trace!(peer = %peer, len, "datagram admitted");

            let datagram = Datagram {
                payload: Bytes::copy_from_slice(&buf[..len]),
                peer,
                _slot: slot,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(datagram).await {
                    tracing::warn!(peer = %peer, error = %e, "datagram worker failed");
                }
            });
        }
    }
}

/// One admitted datagram. Holds its slot until dropped.
pub struct Datagram {
    payload: Bytes,
    peer: SocketAddr,
    _slot: Slot,
}

impl Datagram {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}
