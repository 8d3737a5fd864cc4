//! End-to-end RPC scenarios over an in-memory duplex pair, covering the
//! unary/streaming call semantics and failure modes from `SPEC_FULL.md` §8.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use plex::rpc::{AbortHandle, AbortReason, DelRequest, GetRequest, PutRequest, ScanRequest};
use plex::{CallOpts, ChannelId, Envelope, ErrorCode, PlexError, RpcClient, RpcLimits};

use support::{spawn_listener, spawn_listener_with_limits, KvStore, TEST_ID};

#[tokio::test]
async fn unary_put_get_del_roundtrip() {
    let (client_peer, _server) = spawn_listener(KvStore::new());
    let duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();
    let client = RpcClient::new(duplex).await.unwrap();

    let put = client
        .put(PutRequest { key: Bytes::from_static(b"k1"), value: Bytes::from_static(b"v1"), caps: None }, CallOpts::default())
        .await
        .unwrap();
    assert!(put.is_ok());

    let got = client.get(GetRequest { key: Bytes::from_static(b"k1"), caps: None }, CallOpts::default()).await.unwrap();
    match got {
        Envelope::Ok { value, .. } => assert_eq!(value.unwrap(), Bytes::from_static(b"v1")),
        other => panic!("expected ok with value, got {other:?}"),
    }

    let del = client.del(DelRequest { key: Bytes::from_static(b"k1"), caps: None }, CallOpts::default()).await.unwrap();
    assert!(del.is_ok());

    let missing = client.get(GetRequest { key: Bytes::from_static(b"k1"), caps: None }, CallOpts::default()).await.unwrap();
    match missing {
        Envelope::Ok { value, .. } => assert!(value.is_none()),
        other => panic!("expected ok with no value, got {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn scan_stream_can_be_cancelled_mid_flight() {
    let store = KvStore::with_scan_delay(Duration::from_millis(15));
    for i in 0..10 {
        let key = format!("p/{i}");
        store.seed(&key, "v");
    }
    let (client_peer, _server) = spawn_listener(store);
    let duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();
    let client = RpcClient::new(duplex).await.unwrap();

    let mut iter = client
        .scan(ScanRequest { prefix: Some(Bytes::from_static(b"p/")), ..Default::default() }, CallOpts::default())
        .await
        .unwrap();

    for _ in 0..3 {
        let item = iter.next().await.expect("expected at least 3 rows before cancelling").unwrap();
        assert!(item.is_ok());
    }
    iter.cancel();

    // Give the server a moment to observe the cancel frame and stop the
    // producer before asserting no further rows arrive.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(iter.next().await.is_none(), "no further rows should arrive once cancelled");

    client.close().await;
}

#[tokio::test]
async fn oversized_payload_is_rejected_before_the_handler_runs() {
    let store = KvStore::new();
    let (client_peer, _server) = spawn_listener(store.clone());
    let duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();
    let limits = RpcLimits::default();
    let client = RpcClient::with_limits(duplex, limits.clone()).await.unwrap();

    let oversized = vec![0u8; limits.max_request_bytes + 1];
    let result = client
        .put(PutRequest { key: Bytes::from_static(b"k"), value: Bytes::from(oversized), caps: None }, CallOpts::default())
        .await;

    match result {
        Err(PlexError::PayloadTooLarge { .. }) => {}
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }
    assert_eq!(store.puts_seen.load(std::sync::atomic::Ordering::SeqCst), 0, "handler must never see an oversized payload");

    client.close().await;
}

#[tokio::test]
async fn client_timeout_yields_a_failure_envelope() {
    let store = KvStore::with_get_delay(Duration::from_millis(25));
    let (client_peer, _server) = spawn_listener(store);
    let duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();
    let client = RpcClient::new(duplex).await.unwrap();

    let opts = CallOpts::default().with_timeout(Duration::from_millis(5));
    let env = client.get(GetRequest { key: Bytes::from_static(b"k"), caps: None }, opts).await.unwrap();
    match env {
        Envelope::Err { code, .. } => assert_eq!(code, ErrorCode::Timeout),
        other => panic!("expected a Timeout envelope, got {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn abort_signal_yields_destroyed_with_the_given_reason() {
    let store = KvStore::with_get_delay(Duration::from_millis(40));
    let (client_peer, _server) = spawn_listener(store);
    let duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();
    let client = RpcClient::new(duplex).await.unwrap();

    let abort = AbortHandle::new();
    let opts = CallOpts::default().with_signal(abort.signal());

    let aborter = {
        let abort = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            abort.abort(AbortReason::Custom("stop".to_string()));
        })
    };

    let env = client.get(GetRequest { key: Bytes::from_static(b"k"), caps: None }, opts).await.unwrap();
    match env {
        Envelope::Err { code, message } => {
            assert_eq!(code, ErrorCode::Destroyed);
            assert_eq!(message, "stop");
        }
        other => panic!("expected a Destroyed envelope, got {other:?}"),
    }

    aborter.await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn client_route_limit_rejects_the_second_call_and_destroys_the_transport() {
    let store = KvStore::with_get_delay(Duration::from_millis(200));
    let (client_peer, _server) = spawn_listener_with_limits(store, RpcLimits::default());
    let duplex = client_peer.connect_rpc(ChannelId::from(TEST_ID.to_vec())).await.unwrap();

    let mut limits = RpcLimits::default();
    limits.max_client_routes = 1;
    let client = Arc::new(RpcClient::with_limits(duplex, limits).await.unwrap());

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.get(GetRequest { key: Bytes::from_static(b"k"), caps: None }, CallOpts::default()).await })
    };
    // Give the first call time to occupy the one available route slot.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = client.get(GetRequest { key: Bytes::from_static(b"k2"), caps: None }, CallOpts::default()).await;
    assert!(matches!(second, Err(PlexError::TooManyRoutes)), "second call should trip the route limit, got {second:?}");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!client.is_connected(), "the transport must be reset once the route limit trips");

    let first_result = first.await.unwrap();
    assert!(
        matches!(first_result, Err(PlexError::ConnectionLost)),
        "the first call should observe the transport teardown, got {first_result:?}"
    );
}
