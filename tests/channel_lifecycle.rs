//! Invariants of the channel/duplex layer from `SPEC_FULL.md` §3/§4.1/§4.2/
//! §8: `channel-close` always precedes `channel-destroy`, and a disposer
//! can tear down a listen-side channel whether or not pairing ever happens.

mod support;

use plex::{ChannelId, LifecycleEvent, Peer};

use support::TEST_ID;

#[tokio::test]
async fn disposer_tears_down_an_unpaired_listen_side_channel() {
    let (_client_transport, server_transport) = plex::transport::mem::MemTransport::pair();
    let server_peer = Peer::listen(server_transport);
    let duplex = server_peer.listen_rpc(ChannelId::from(TEST_ID.to_vec()));

    // Nothing ever connects on the other end — the disposer must still be
    // able to tear this down without panicking or hanging.
    let disposer = duplex.disposer();
    disposer.destroy(None).await;

    assert!(!duplex.is_connected().await, "a never-paired channel must never report connected");
}

#[tokio::test]
async fn listen_side_writes_before_pairing_are_buffered_and_flush_in_order() {
    let (client_transport, server_transport) = plex::transport::mem::MemTransport::pair();
    let server_peer = Peer::listen(server_transport);
    let listen_duplex = server_peer.listen_rpc(ChannelId::from(TEST_ID.to_vec()));

    // No remote has paired yet — these must buffer, not error.
    listen_duplex.send(&b"first"[..]).await.unwrap();
    listen_duplex.send(&b"second"[..]).await.unwrap();

    let client_peer = Peer::connect(client_transport);
    let mut client_duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();

    assert_eq!(client_duplex.recv().await.as_deref(), Some(&b"first"[..]));
    assert_eq!(client_duplex.recv().await.as_deref(), Some(&b"second"[..]));
}

#[tokio::test]
async fn connect_side_observes_remote_open_then_close_then_destroy() {
    let (client_transport, server_transport) = plex::transport::mem::MemTransport::pair();
    let _server_peer = Peer::listen(server_transport);
    let client_peer = Peer::connect(client_transport);

    let mut client_duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();
    assert!(client_duplex.is_connected().await);

    match client_duplex.next_event().await {
        Some(LifecycleEvent::RemoteOpen(_)) => {}
        other => panic!("expected RemoteOpen as the first event, got {other:?}"),
    }

    client_duplex.close().await;

    match client_duplex.next_event().await {
        Some(LifecycleEvent::Close) => {}
        other => panic!("expected Close immediately after close(), got {other:?}"),
    }
    match client_duplex.next_event().await {
        Some(LifecycleEvent::Destroy(_)) => {}
        other => panic!("expected Destroy right after Close, got {other:?}"),
    }

    assert!(!client_duplex.is_connected().await);
}
