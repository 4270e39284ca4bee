use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use pulse_core::Update;
use pulsed::heartbeat::{REPLY_BAD, REPLY_NEW, REPLY_SEEN};
use pulsed::transport;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Peer liveness end to end
// ══════════════════════════════════════════════════════════════════════════════

async fn exchange(stream: &mut TcpStream, name: &[u8]) -> Result<Vec<u8>> {
    transport::send_netstring(stream, name).await?;
    let reply = timeout(WAIT, transport::read_netstring(stream, 64))
        .await??
        .ok_or_else(|| anyhow::anyhow!("server closed before replying"))?;
    Ok(reply.to_vec())
}

#[tokio::test]
async fn test_tcp_and_udp_heartbeats_share_one_registry() -> Result<()> {
    let registry = manual_peer_registry(3);

    let tcp = {
        let registry = registry.clone();
        start_tcp(dispatch_config(8), move |conn| {
            heartbeat::serve_connection(registry.clone(), conn)
        })
        .await?
    };
    let udp = {
        let registry = registry.clone();
        start_udp(dispatch_config(8), move |d| {
            heartbeat::serve_datagram(registry.clone(), d)
        })
        .await?
    };

    let mut stream = TcpStream::connect(tcp.addr).await?;
    assert_eq!(exchange(&mut stream, b"node-a").await?, REPLY_NEW);

    let datagrams = UdpSocket::bind("127.0.0.1:0").await?;
    datagrams.send_to(b"node-b", udp.addr).await?;
    wait_for_condition(|| registry.contains("node-b")).await?;

    // A UDP sighting refreshes a peer first seen over TCP.
    datagrams.send_to(b"node-a", udp.addr).await?;
    assert_eq!(exchange(&mut stream, b"node-b").await?, REPLY_SEEN);
    assert_eq!(exchange(&mut stream, b"").await.ok(), None);

    assert_eq!(registry.size(), 2);
    tcp.stop().await?;
    udp.stop().await
}

#[tokio::test]
async fn test_silent_peer_expires_and_returns_as_new() -> Result<()> {
    let registry = manual_peer_registry(2);
    let tcp = {
        let registry = registry.clone();
        start_tcp(dispatch_config(4), move |conn| {
            heartbeat::serve_connection(registry.clone(), conn)
        })
        .await?
    };

    let mut stream = TcpStream::connect(tcp.addr).await?;
    assert_eq!(exchange(&mut stream, b"alpha").await?, REPLY_NEW);
    assert_eq!(exchange(&mut stream, b"beta").await?, REPLY_NEW);

    registry.tick();
    assert_eq!(exchange(&mut stream, b"alpha").await?, REPLY_SEEN);
    registry.tick();

    // beta never refreshed: gone after two ticks. alpha has one left.
    assert!(!registry.contains("beta"));
    assert_eq!(registry.ttl("alpha"), Some(1));

    assert_eq!(exchange(&mut stream, b"beta").await?, REPLY_NEW);
    assert_eq!(exchange(&mut stream, b"   ").await?, REPLY_BAD);

    drop(stream);
    tcp.stop().await
}

#[tokio::test]
async fn test_oversized_name_closes_stream() -> Result<()> {
    let registry = manual_peer_registry(2);
    let tcp = {
        let registry = registry.clone();
        start_tcp(dispatch_config(1), move |conn| {
            heartbeat::serve_connection(registry.clone(), conn)
        })
        .await?
    };

    let mut stream = TcpStream::connect(tcp.addr).await?;
    let long = vec![b'x'; heartbeat::MAX_NAME_LEN + 1];
    transport::send_netstring(&mut stream, &long).await?;
    let reply = timeout(WAIT, transport::read_netstring(&mut stream, 64)).await?;
    assert!(matches!(reply, Ok(None) | Err(_)));

    let admission = tcp.admission.clone();
    wait_for_condition(|| admission.in_flight() == 0).await?;
    assert!(registry.is_empty());
    tcp.stop().await
}

#[test]
fn test_record_reports_update_outcome() {
    let registry = manual_peer_registry(4);
    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let first = heartbeat::record(&registry, "n".into(), peer, heartbeat::Transport::Udp);
    let again = heartbeat::record(&registry, "n".into(), peer, heartbeat::Transport::Udp);
    assert_eq!((first, again), (Update::Created, Update::Refreshed));
}
