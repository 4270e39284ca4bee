use std::io;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Admission control
// ══════════════════════════════════════════════════════════════════════════════

/// Worker that greets, then holds its slot until the client sends a byte
/// or closes.
async fn hold_until_client_speaks(mut conn: Connection) -> Result<()> {
    conn.send_bytes(b"ok").await?;
    let _ = conn.read_bytes(1).await?;
    Ok(())
}

async fn connect_admitted(addr: SocketAddr) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut greeting = [0u8; 2];
    timeout(WAIT, stream.read_exact(&mut greeting)).await??;
    assert_eq!(&greeting, b"ok");
    Ok(stream)
}

/// Rejected connections are closed without ever reaching a worker.
async fn assert_rejected(addr: SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut buf = [0u8; 2];
    match timeout(WAIT, stream.read(&mut buf)).await? {
        Ok(0) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
        other => bail!("expected a closed connection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tcp_third_connection_rejected_until_slot_frees() -> Result<()> {
    let server = start_tcp(dispatch_config(2), hold_until_client_speaks).await?;

    let mut first = connect_admitted(server.addr).await?;
    let _second = connect_admitted(server.addr).await?;
    assert_eq!(server.admission.in_flight(), 2);

    assert_rejected(server.addr).await?;
    assert_eq!(server.admission.in_flight(), 2);

    // Releasing one slot admits the next connection.
    first.write_all(b"x").await?;
    let admission = server.admission.clone();
    wait_for_condition(|| admission.in_flight() == 1).await?;

    let _third = connect_admitted(server.addr).await?;
    assert_eq!(server.admission.in_flight(), 2);

    server.stop().await
}

#[tokio::test]
async fn test_tcp_slots_return_after_every_exit_path() -> Result<()> {
    let server = start_tcp(dispatch_config(3), |mut conn: Connection| async move {
        conn.send_bytes(b"ok").await?;
        let got = conn.read_bytes(1).await?;
        match got.first() {
            Some(b'e') => bail!("handler error"),
            Some(b'p') => panic!("handler panic"),
            _ => anyhow::Ok(()),
        }
    })
    .await?;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect_admitted(server.addr).await?);
    }
    assert_eq!(server.admission.in_flight(), 3);

    clients[0].write_all(b"e").await?;
    clients[1].write_all(b"p").await?;
    clients.pop();

    let admission = server.admission.clone();
    wait_for_condition(|| admission.in_flight() == 0).await?;

    // Full capacity is available again.
    for _ in 0..3 {
        let _ = connect_admitted(server.addr).await?;
    }
    server.stop().await
}

#[tokio::test]
async fn test_udp_datagram_discarded_while_at_capacity() -> Result<()> {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Bytes>();
    let (gate_tx, gate_rx) = watch::channel(false);

    let server = start_udp(dispatch_config(1), move |d: Datagram| {
        let seen_tx = seen_tx.clone();
        let mut gate = gate_rx.clone();
        async move {
            seen_tx.send(d.payload().clone())?;
            gate.wait_for(|open| *open).await?;
            anyhow::Ok(())
        }
    })
    .await?;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.send_to(b"one", server.addr).await?;
    let first = timeout(WAIT, seen_rx.recv()).await?.expect("worker alive");
    assert_eq!(&first[..], b"one");
    assert_eq!(server.admission.in_flight(), 1);

    client.send_to(b"two", server.addr).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    gate_tx.send(true)?;
    let admission = server.admission.clone();
    wait_for_condition(|| admission.in_flight() == 0).await?;

    client.send_to(b"three", server.addr).await?;
    let next = timeout(WAIT, seen_rx.recv()).await?.expect("worker alive");
    assert_eq!(&next[..], b"three");
    assert!(seen_rx.try_recv().is_err());

    server.stop().await
}
