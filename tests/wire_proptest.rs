//! Round-trip laws for the wire codec (`SPEC_FULL.md` §4.4/§6) that the
//! inline unit tests in `src/rpc/wire.rs` only sample a handful of fixed
//! cases for. These generalize the same round-trip property over
//! arbitrary inputs.

use bytes::Bytes;

use plex::rpc::{Frame, MethodId, PutRequest, RequestPayload, ScanRequest};
use plex::{Envelope, ErrorCode};

use proptest::prelude::*;
use proptest::proptest;

fn error_code_strategy() -> impl Strategy<Value = ErrorCode> {
    prop_oneof![
        Just(ErrorCode::BadArg),
        Just(ErrorCode::CodecError),
        Just(ErrorCode::CasFailed),
        Just(ErrorCode::CapabilityDenied),
        Just(ErrorCode::Timeout),
        Just(ErrorCode::DriverError),
        Just(ErrorCode::CryptoError),
        Just(ErrorCode::NotAvailable),
        Just(ErrorCode::NotReady),
        Just(ErrorCode::PayloadTooLarge),
        Just(ErrorCode::Closed),
        Just(ErrorCode::Destroyed),
        Just(ErrorCode::Unknown),
    ]
}

proptest! {
    #[test]
    fn envelope_ok_round_trips_for_any_value(value in proptest::collection::vec(any::<u8>(), 0..64)) {
        let env = Envelope::ok_value(Bytes::from(value.clone()));
        let decoded = Envelope::decode(env.encode()).unwrap();
        match decoded {
            Envelope::Ok { value: Some(v), meta_key: None } => prop_assert_eq!(v.to_vec(), value),
            other => prop_assert!(false, "expected Ok with the original value, got {:?}", other),
        }
    }

    #[test]
    fn envelope_err_round_trips_for_any_code_and_message(code in error_code_strategy(), message in ".*") {
        let env = Envelope::err(code, message.clone());
        let decoded = Envelope::decode(env.encode()).unwrap();
        match decoded {
            Envelope::Err { code: decoded_code, message: decoded_message } => {
                prop_assert_eq!(decoded_code, code);
                prop_assert_eq!(decoded_message, message);
            }
            other => prop_assert!(false, "expected Err, got {:?}", other),
        }
    }

    #[test]
    fn put_request_round_trips_for_any_key_value_and_caps(
        key in proptest::collection::vec(any::<u8>(), 0..32),
        value in proptest::collection::vec(any::<u8>(), 0..32),
        has_caps in any::<bool>(),
        caps_bytes in proptest::collection::vec(any::<u8>(), 0..16),
    ) {
        let caps = if has_caps { Some(Bytes::from(caps_bytes)) } else { None };
        let req = RequestPayload::Put(PutRequest { key: Bytes::from(key.clone()), value: Bytes::from(value.clone()), caps: caps.clone() });
        let decoded = RequestPayload::decode(MethodId::Put, req.encode()).unwrap();
        match decoded {
            RequestPayload::Put(r) => {
                prop_assert_eq!(r.key.to_vec(), key);
                prop_assert_eq!(r.value.to_vec(), value);
                prop_assert_eq!(r.caps, caps);
            }
            other => prop_assert!(false, "expected Put, got {:?}", other),
        }
    }

    #[test]
    fn frame_request_round_trips_for_any_rid_and_payload(
        rid in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let frame = Frame::Request { rid, method: MethodId::Get, payload: Bytes::from(payload.clone()) };
        let decoded = Frame::decode(frame.encode()).unwrap();
        match decoded {
            Frame::Request { rid: decoded_rid, method: MethodId::Get, payload: decoded_payload } => {
                prop_assert_eq!(decoded_rid, rid);
                prop_assert_eq!(decoded_payload.to_vec(), payload);
            }
            other => prop_assert!(false, "expected a Get request, got {:?}", other),
        }
    }
}

#[test_strategy::proptest]
fn scan_request_round_trips_for_any_prefix_and_reverse(
    #[strategy(proptest::collection::vec(any::<u8>(), 0..32))] prefix_bytes: Vec<u8>,
    reverse: bool,
) {
    let req = RequestPayload::Scan(ScanRequest { prefix: Some(Bytes::from(prefix_bytes.clone())), reverse, ..Default::default() });
    let decoded = RequestPayload::decode(MethodId::Scan, req.encode()).unwrap();
    match decoded {
        RequestPayload::Scan(r) => {
            assert_eq!(r.prefix.unwrap().to_vec(), prefix_bytes);
            assert_eq!(r.reverse, reverse);
        }
        other => panic!("expected Scan, got {other:?}"),
    }
}
