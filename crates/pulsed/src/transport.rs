//! Byte-exact stream and datagram helpers used by dispatcher workers.
//!
//! The read helpers retry short reads until the requested amount arrived or
//! the peer closed; the write helpers retry short writes until everything is
//! sent. Netstring framing is defined in `pulse_core::netstring`.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UdpSocket;
use tokio::time::{Instant, Sleep};

use pulse_core::netstring::{self, FrameError, LengthParser};

/// Blank line terminating a header block.
pub const HEADER_END: &[u8] = b"\r\n\r\n";

/// Write the whole buffer. Returns the number of bytes sent.
pub async fn send_bytes<W>(w: &mut W, buf: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(buf).await?;
    Ok(buf.len())
}

/// Read exactly `n` bytes, or fewer if the peer closes first.
pub async fn read_bytes<R>(r: &mut R, n: usize) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::zeroed(n);
    let mut filled = 0;
    while filled < n {
        let got = r.read(&mut buf[filled..]).await?;
        if got == 0 {
            break;
        }
        filled += got;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}

/// Read until `delim` has been seen (inclusive), `limit` bytes have been
/// read, or the peer closes. Reads one byte at a time so nothing past the
/// delimiter is consumed.
pub async fn read_delimited<R>(r: &mut R, limit: usize, delim: &[u8]) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(limit.min(4096));
    while buf.len() < limit {
        let mut byte = [0u8; 1];
        if r.read(&mut byte).await? == 0 {
            break;
        }
        buf.extend_from_slice(&byte);
        if !delim.is_empty() && buf.ends_with(delim) {
            break;
        }
    }
    Ok(buf.freeze())
}

/// Read one netstring. `Ok(None)` means the peer closed cleanly between
/// frames; an empty payload is the terminator message.
pub async fn read_netstring<R>(r: &mut R, max_len: usize) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut parser = LengthParser::new();
    let len = loop {
        let mut byte = [0u8; 1];
        if r.read(&mut byte).await? == 0 {
            return if parser.started() {
                Err(FrameError::UnexpectedEof)
            } else {
                Ok(None)
            };
        }
        if let Some(len) = parser.push(byte[0])? {
            break len;
        }
    };
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut buf = BytesMut::zeroed(len + 1);
    r.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
        _ => FrameError::Io(e),
    })?;
    if buf[len] != b',' {
        return Err(FrameError::MissingComma(buf[len]));
    }
    buf.truncate(len);
    Ok(Some(buf.freeze()))
}

/// Frame and send one payload.
pub async fn send_netstring<W>(w: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    netstring::encode(payload, &mut buf);
    w.write_all(&buf).await
}

/// Send one datagram from an ephemeral socket of the destination's family.
pub async fn udp_send(addr: SocketAddr, payload: &[u8]) -> io::Result<usize> {
    let local: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.send_to(payload, addr).await
}

// ── Idle timeout ──────────────────────────────────────────────────────────────

/// Stand-in deadline for timeouts too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Fails a read with `TimedOut` once it has waited `timeout` without any
/// data arriving. The clock restarts after every completed read, so a slow
/// but live peer is never cut off. Writes pass through untouched.
pub struct IdleTimeout<S> {
    inner: S,
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    /// `now + timeout`, or a far-future deadline if that overflows.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout).unwrap_or_else(|| now + FAR_FUTURE)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.armed = false;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if !this.armed {
                    let deadline = this.deadline();
                    this.sleep.as_mut().reset(deadline);
                    this.armed = true;
                }
                match this.sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.armed = false;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "receive idle timeout",
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
