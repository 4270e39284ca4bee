//! Connection-oriented accept loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use pulse_core::config::DispatchConfig;
use pulse_core::netstring::FrameError;

use super::{bind_first, resolve, Admission, Kind, Slot};
use crate::transport::{self, IdleTimeout};

pub struct TcpDispatcher {
    listener: TcpListener,
    admission: Admission,
    idle_timeout: Duration,
}

impl TcpDispatcher {
    /// Resolve `host`, bind and listen. Fails if no candidate address works.
    pub async fn bind(host: &str, port: u16, config: &DispatchConfig) -> Result<Self> {
        let addrs = resolve(host, port).await?;
        let socket = bind_first(
            &addrs,
            Kind::Stream {
                backlog: config.backlog,
            },
        )?;
        let listener = TcpListener::from_std(socket.into())
            .context("failed to register TCP listener with the runtime")?;

        Ok(Self {
            listener,
            admission: Admission::new(config.max_concurrent),
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the shared ceiling, for inspection.
    pub fn admission(&self) -> Admission {
        self.admission.clone()
    }

    /// Accept until `shutdown` fires. Never blocks on a busy worker: when
    /// every slot is taken, new connections are closed on the spot.
    pub async fn run<H, Fut>(self, handler: H, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        H: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let local = self.listener.local_addr().ok();

        tracing::info!(
            addr = ?local,
            max_concurrent = self.admission.max_concurrent(),
            "tcp dispatcher listening"
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(addr = ?local, "tcp dispatcher stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                }
            };

            let Some(slot) = self.admission.try_admit() else {
                tracing::warn!(
                    peer = %peer,
                    max_concurrent = self.admission.max_concurrent(),
                    "at capacity, rejecting connection"
                );
                drop(stream);
                continue;
            };

            tracing::debug!(
                peer = %peer,
                in_flight = self.admission.in_flight(),
                "connection admitted"
            );

            let conn = Connection {
                stream: IdleTimeout::new(stream, self.idle_timeout),
                peer,
                _slot: slot,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(conn).await {
                    tracing::warn!(peer = %peer, error = %e, "connection worker failed");
                }
            });
        }
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// An admitted stream. Every receive is bounded by the idle timeout; a
/// timed-out receive fails with `io::ErrorKind::TimedOut`. Dropping the
/// connection closes the socket and frees the slot.
pub struct Connection {
    stream: IdleTimeout<TcpStream>,
    peer: SocketAddr,
    _slot: Slot,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn read_netstring(&mut self, max_len: usize) -> Result<Option<Bytes>, FrameError> {
        transport::read_netstring(&mut self.stream, max_len).await
    }

    pub async fn send_netstring(&mut self, payload: &[u8]) -> io::Result<()> {
        transport::send_netstring(&mut self.stream, payload).await
    }

    pub async fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        transport::read_bytes(&mut self.stream, n).await
    }

    pub async fn send_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        transport::send_bytes(&mut self.stream, buf).await
    }

    pub async fn read_delimited(&mut self, limit: usize, delim: &[u8]) -> io::Result<Bytes> {
        transport::read_delimited(&mut self.stream, limit, delim).await
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
