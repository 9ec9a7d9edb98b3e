//! Integration tests: several endpoints on one in-process network.

use std::time::Duration;

use meshcast_transport::{
    ChannelEvent, Endpoint, ErrorKind, MemoryNetwork, NodeAddress, Signaling, TransportConfig,
};

fn addr(s: &str) -> NodeAddress {
    s.parse().unwrap()
}

/// A dials B, B answers on the same channel, both see each other's records.
#[tokio::test]
async fn two_endpoints_exchange_records() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let net = MemoryNetwork::new();
    let (a, mut a_rx) = net.open(addr("n-alice"), &TransportConfig::new()).await.unwrap();
    let (b, mut b_rx) = net.open(addr("n-bob"), &TransportConfig::new()).await.unwrap();

    a.connect(&addr("n-bob")).await.unwrap();
    a.send(&addr("n-bob"), b"ping".to_vec()).await.unwrap();

    let mut got = Vec::new();
    while got.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .expect("recv timed out")
            .unwrap();
        got.push(event);
    }
    assert_eq!(got[0], ChannelEvent::Open { remote: addr("n-alice") });
    assert_eq!(
        got[1],
        ChannelEvent::Data {
            remote: addr("n-alice"),
            bytes: b"ping".to_vec()
        }
    );

    // Reply over the inbound channel without dialing.
    b.send(&addr("n-alice"), b"pong".to_vec()).await.unwrap();
    let _open = a_rx.recv().await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), a_rx.recv())
        .await
        .expect("recv timed out")
        .unwrap();
    assert_eq!(
        reply,
        ChannelEvent::Data {
            remote: addr("n-bob"),
            bytes: b"pong".to_vec()
        }
    );

    a.shutdown().await;
    b.shutdown().await;
    assert!(net.registered().await.is_empty());
}

/// A crashed hub leaves its rendezvous address free for the next claimant.
#[tokio::test]
async fn crash_frees_rendezvous_address() {
    let net = MemoryNetwork::new();
    let room = addr("mc-room-491000");
    let (_hub, _hub_rx) = net.open(room.clone(), &TransportConfig::new()).await.unwrap();
    let (client, mut client_rx) = net.open(addr("n-carol"), &TransportConfig::new()).await.unwrap();

    client.connect(&room).await.unwrap();
    assert_eq!(client_rx.recv().await, Some(ChannelEvent::Open { remote: room.clone() }));

    assert!(net.crash(&room).await);
    assert_eq!(client_rx.recv().await, Some(ChannelEvent::Closed { remote: room.clone() }));

    let err = client.connect(&room).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerUnreachable);

    let (_new_hub, _rx) = net.open(room.clone(), &TransportConfig::new()).await.unwrap();
    client.connect(&room).await.unwrap();
    assert_eq!(client.open_channels().await, vec![room]);
}

/// Connect latency is honoured under paused time.
#[tokio::test(start_paused = true)]
async fn link_latency_delays_connect() {
    let net = MemoryNetwork::new();
    let slow = TransportConfig::new().link_latency(Duration::from_millis(250));
    let (a, _a_rx) = net.open(addr("a"), &slow).await.unwrap();
    let (_b, _b_rx) = net.open(addr("b"), &TransportConfig::new()).await.unwrap();

    let started = tokio::time::Instant::now();
    a.connect(&addr("b")).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
}

/// Severing a link closes it on both ends, other links are untouched.
#[tokio::test]
async fn sever_is_scoped_to_one_link() {
    let net = MemoryNetwork::new();
    let (a, _a_rx) = net.open(addr("a"), &TransportConfig::new()).await.unwrap();
    let (b, _b_rx) = net.open(addr("b"), &TransportConfig::new()).await.unwrap();
    let (_c, _c_rx) = net.open(addr("c"), &TransportConfig::new()).await.unwrap();

    a.connect(&addr("b")).await.unwrap();
    a.connect(&addr("c")).await.unwrap();
    assert!(net.sever(&addr("a"), &addr("b")).await);

    assert_eq!(a.open_channels().await, vec![addr("c")]);
    assert!(b.open_channels().await.is_empty());
}
