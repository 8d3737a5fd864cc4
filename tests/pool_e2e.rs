//! Peer pool selection-policy scenarios from `SPEC_FULL.md` §8: weighted
//! bias and sticky-key stability, plus the pool's broadcast event stream.

mod support;

use bytes::Bytes;

use plex::pool::{Locality, PeerMeta, PeerPool, Policy, PoolCallOpts};
use plex::rpc::{GetRequest, MethodId, RequestPayload};
use plex::{CallKind, CallOpts, ChannelId, Envelope, PoolEvent, LANE_RPC};

use support::{spawn_listener, KvStore, TEST_ID};

fn get_request() -> RequestPayload {
    RequestPayload::Get(GetRequest { key: Bytes::from_static(b"k"), caps: None })
}

#[tokio::test]
async fn weighted_policy_biases_towards_the_heavier_peer() {
    let pool = PeerPool::new();

    let (peer1, _s1) = spawn_listener(KvStore::labeled("p1"));
    let (peer2, _s2) = spawn_listener(KvStore::labeled("p2"));
    let (peer3, _s3) = spawn_listener(KvStore::labeled("p3"));

    pool.add(peer1, 1, PeerMeta { source: None, locality: Some(Locality::Wan) });
    pool.add(peer2, 5, PeerMeta { source: None, locality: Some(Locality::Wan) });
    pool.add(peer3, 1, PeerMeta { source: None, locality: Some(Locality::Wan) });

    for _ in 0..60 {
        pool.call(
            &Policy::Weighted,
            &PoolCallOpts::default(),
            ChannelId::from(TEST_ID.to_vec()),
            LANE_RPC,
            MethodId::Get,
            get_request(),
            CallOpts::default(),
        )
        .await
        .unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.len(), 3);
    let successes: Vec<u64> = stats.iter().map(|s| s.successes).collect();
    assert!(successes[1] > successes[0], "peer 2 (weight 5) should get strictly more calls than peer 1, got {successes:?}");
    assert!(successes[1] > successes[2], "peer 2 (weight 5) should get strictly more calls than peer 3, got {successes:?}");

    pool.destroy().await;
}

#[tokio::test]
async fn sticky_policy_routes_consistently_by_key() {
    let pool = PeerPool::new();

    let (peer_a, _sa) = spawn_listener(KvStore::labeled("peer-a"));
    let (peer_b, _sb) = spawn_listener(KvStore::labeled("peer-b"));

    pool.add(peer_a, 1, PeerMeta::default());
    pool.add(peer_b, 1, PeerMeta::default());

    for key in ["key-a", "key-b"] {
        let mut labels = Vec::new();
        for _ in 0..5 {
            let opts = PoolCallOpts { sticky_key: Some(Bytes::copy_from_slice(key.as_bytes())), prefer_local: false };
            let env = pool
                .call(&Policy::StickyByKey, &opts, ChannelId::from(TEST_ID.to_vec()), LANE_RPC, MethodId::Get, get_request(), CallOpts::default())
                .await
                .unwrap();
            match env {
                Envelope::Ok { value, .. } => labels.push(value.unwrap()),
                other => panic!("expected ok, got {other:?}"),
            }
        }
        let first = labels[0].clone();
        assert!(labels.iter().all(|l| l == &first), "all calls for {key} must land on the same peer, got {labels:?}");
    }

    pool.destroy().await;
}

#[tokio::test]
async fn pool_emits_call_events_on_its_broadcast_stream() {
    let pool = PeerPool::new();
    let (peer, _s) = spawn_listener(KvStore::new());
    pool.add(peer, 1, PeerMeta::default());

    let mut events = pool.subscribe();
    pool.call(&Policy::RoundRobin, &PoolCallOpts::default(), ChannelId::from(TEST_ID.to_vec()), LANE_RPC, MethodId::Get, get_request(), CallOpts::default())
        .await
        .unwrap();

    let mut saw_call_complete = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PoolEvent::Call { kind: CallKind::Complete }) {
            saw_call_complete = true;
        }
    }
    assert!(saw_call_complete, "expected a Call{{kind: Complete}} event on the broadcast stream");

    pool.destroy().await;
}
