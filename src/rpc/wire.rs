//! RPC wire format (§4.4, §6): frames, method ids, request payloads, and
//! the success/failure envelope. Integer fields are little-endian; strings
//! are `u16`-length-prefixed UTF-8; byte arrays are `u32`-length-prefixed;
//! booleans are a single byte (`1` = true).
//!
//! Every decoder here is defensive — frames arrive from a peer, never from
//! a value this process constructed — so truncated or malformed input
//! returns [`PlexError::BadPayload`] rather than panicking.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, PlexError, Result};

/// `type=0`.
pub const FRAME_REQUEST: u8 = 0;
/// `type=1`.
pub const FRAME_RESPONSE: u8 = 1;
/// `type=2`.
pub const FRAME_CANCEL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodId {
    Get = 0,
    Put = 1,
    Del = 2,
    Scan = 3,
    Append = 4,
}

impl MethodId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MethodId::Get),
            1 => Ok(MethodId::Put),
            2 => Ok(MethodId::Del),
            3 => Ok(MethodId::Scan),
            4 => Ok(MethodId::Append),
            _ => Err(PlexError::BadPayload),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MethodId::Get => "get",
            MethodId::Put => "put",
            MethodId::Del => "del",
            MethodId::Scan => "scan",
            MethodId::Append => "append",
        }
    }
}

/// One logical RPC frame, carried as one multiplex message (§4.4).
#[derive(Debug, Clone)]
pub enum Frame {
    Request { rid: u32, method: MethodId, payload: Bytes },
    Response { rid: u32, method: MethodId, more: bool, payload: Bytes },
    Cancel { rid: u32, method: MethodId },
}

impl Frame {
    pub fn rid(&self) -> u32 {
        match self {
            Frame::Request { rid, .. } | Frame::Response { rid, .. } | Frame::Cancel { rid, .. } => *rid,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Request { rid, method, payload } => {
                buf.put_u8(FRAME_REQUEST);
                buf.put_u32_le(*rid);
                buf.put_u8(method.as_u8());
                buf.put_slice(payload);
            }
            Frame::Response { rid, method, more, payload } => {
                buf.put_u8(FRAME_RESPONSE);
                buf.put_u32_le(*rid);
                buf.put_u8(method.as_u8());
                buf.put_u8(if *more { 1 } else { 0 });
                buf.put_slice(payload);
            }
            Frame::Cancel { rid, method } => {
                buf.put_u8(FRAME_CANCEL);
                buf.put_u32_le(*rid);
                buf.put_u8(method.as_u8());
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < 6 {
            return Err(PlexError::BadPayload);
        }
        let kind = buf.get_u8();
        let rid = buf.get_u32_le();
        let method = MethodId::from_u8(buf.get_u8())?;
        match kind {
            FRAME_REQUEST => Ok(Frame::Request { rid, method, payload: buf }),
            FRAME_RESPONSE => {
                if buf.is_empty() {
                    return Err(PlexError::BadPayload);
                }
                let more = buf.get_u8() != 0;
                Ok(Frame::Response { rid, method, more, payload: buf })
            }
            FRAME_CANCEL => Ok(Frame::Cancel { rid, method }),
            _ => Err(PlexError::BadPayload),
        }
    }
}

fn put_bytes32(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn get_bytes32(buf: &mut Bytes) -> Result<Bytes> {
    if buf.len() < 4 {
        return Err(PlexError::BadPayload);
    }
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return Err(PlexError::BadPayload);
    }
    Ok(buf.split_to(len))
}

fn put_str16(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_str16(buf: &mut Bytes) -> Result<String> {
    if buf.len() < 2 {
        return Err(PlexError::BadPayload);
    }
    let len = buf.get_u16_le() as usize;
    if buf.len() < len {
        return Err(PlexError::BadPayload);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| PlexError::BadPayload)
}

fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(if v { 1 } else { 0 });
}

fn get_bool(buf: &mut Bytes) -> Result<bool> {
    if buf.is_empty() {
        return Err(PlexError::BadPayload);
    }
    Ok(buf.get_u8() != 0)
}

fn put_opt_bytes(buf: &mut BytesMut, data: &Option<Bytes>) {
    match data {
        Some(b) => {
            put_bool(buf, true);
            put_bytes32(buf, b);
        }
        None => put_bool(buf, false),
    }
}

fn get_opt_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    if get_bool(buf)? {
        Ok(Some(get_bytes32(buf)?))
    } else {
        Ok(None)
    }
}

/// The universal ok/err result container (§3, §6).
#[derive(Debug, Clone)]
pub enum Envelope {
    Ok { value: Option<Bytes>, meta_key: Option<Bytes> },
    Err { code: ErrorCode, message: String },
}

impl Envelope {
    pub fn ok() -> Self {
        Envelope::Ok { value: None, meta_key: None }
    }

    pub fn ok_value(value: impl Into<Bytes>) -> Self {
        Envelope::Ok { value: Some(value.into()), meta_key: None }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Envelope::Err { code, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Envelope::Ok { .. })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Envelope::Ok { value, meta_key } => {
                put_bool(&mut buf, true);
                put_opt_bytes(&mut buf, value);
                put_opt_bytes(&mut buf, meta_key);
            }
            Envelope::Err { code, message } => {
                put_bool(&mut buf, false);
                put_str16(&mut buf, code.as_str());
                put_str16(&mut buf, message);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let ok = get_bool(&mut buf)?;
        if ok {
            let value = get_opt_bytes(&mut buf)?;
            let meta_key = get_opt_bytes(&mut buf)?;
            Ok(Envelope::Ok { value, meta_key })
        } else {
            let code = ErrorCode::parse(&get_str16(&mut buf)?);
            let message = get_str16(&mut buf)?;
            Ok(Envelope::Err { code, message })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Range {
    pub gte: Option<Bytes>,
    pub gt: Option<Bytes>,
    pub lte: Option<Bytes>,
    pub lt: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub key: Bytes,
    pub caps: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: Bytes,
    pub value: Bytes,
    pub caps: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub key: Bytes,
    pub caps: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub value: Bytes,
    pub caps: Option<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub prefix: Option<Bytes>,
    pub reverse: bool,
    pub range: Range,
    pub caps: Option<Bytes>,
}

/// The decoded request payload, tagged by method.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Get(GetRequest),
    Put(PutRequest),
    Del(DelRequest),
    Append(AppendRequest),
    Scan(ScanRequest),
}

impl RequestPayload {
    pub fn caps(&self) -> Option<&Bytes> {
        match self {
            RequestPayload::Get(r) => r.caps.as_ref(),
            RequestPayload::Put(r) => r.caps.as_ref(),
            RequestPayload::Del(r) => r.caps.as_ref(),
            RequestPayload::Append(r) => r.caps.as_ref(),
            RequestPayload::Scan(r) => r.caps.as_ref(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            RequestPayload::Get(r) => {
                put_bytes32(&mut buf, &r.key);
                put_opt_bytes(&mut buf, &r.caps);
            }
            RequestPayload::Put(r) => {
                put_bytes32(&mut buf, &r.key);
                put_bytes32(&mut buf, &r.value);
                put_opt_bytes(&mut buf, &r.caps);
            }
            RequestPayload::Del(r) => {
                put_bytes32(&mut buf, &r.key);
                put_opt_bytes(&mut buf, &r.caps);
            }
            RequestPayload::Append(r) => {
                put_bytes32(&mut buf, &r.value);
                put_opt_bytes(&mut buf, &r.caps);
            }
            RequestPayload::Scan(r) => {
                put_opt_bytes(&mut buf, &r.prefix);
                put_bool(&mut buf, r.reverse);
                put_opt_bytes(&mut buf, &r.range.gte);
                put_opt_bytes(&mut buf, &r.range.gt);
                put_opt_bytes(&mut buf, &r.range.lte);
                put_opt_bytes(&mut buf, &r.range.lt);
                put_opt_bytes(&mut buf, &r.caps);
            }
        }
        buf.freeze()
    }

    pub fn decode(method: MethodId, mut buf: Bytes) -> Result<Self> {
        match method {
            MethodId::Get => {
                let key = get_bytes32(&mut buf)?;
                let caps = get_opt_bytes(&mut buf)?;
                Ok(RequestPayload::Get(GetRequest { key, caps }))
            }
            MethodId::Put => {
                let key = get_bytes32(&mut buf)?;
                let value = get_bytes32(&mut buf)?;
                let caps = get_opt_bytes(&mut buf)?;
                Ok(RequestPayload::Put(PutRequest { key, value, caps }))
            }
            MethodId::Del => {
                let key = get_bytes32(&mut buf)?;
                let caps = get_opt_bytes(&mut buf)?;
                Ok(RequestPayload::Del(DelRequest { key, caps }))
            }
            MethodId::Append => {
                let value = get_bytes32(&mut buf)?;
                let caps = get_opt_bytes(&mut buf)?;
                Ok(RequestPayload::Append(AppendRequest { value, caps }))
            }
            MethodId::Scan => {
                let prefix = get_opt_bytes(&mut buf)?;
                let reverse = get_bool(&mut buf)?;
                let gte = get_opt_bytes(&mut buf)?;
                let gt = get_opt_bytes(&mut buf)?;
                let lte = get_opt_bytes(&mut buf)?;
                let lt = get_opt_bytes(&mut buf)?;
                let caps = get_opt_bytes(&mut buf)?;
                Ok(RequestPayload::Scan(ScanRequest { prefix, reverse, range: Range { gte, gt, lte, lt }, caps }))
            }
        }
    }

    /// Inject a capability token, overriding whatever was present (used by
    /// [`crate::service::with_caps`]).
    pub fn with_caps(mut self, token: Bytes) -> Self {
        let slot = match &mut self {
            RequestPayload::Get(r) => &mut r.caps,
            RequestPayload::Put(r) => &mut r.caps,
            RequestPayload::Del(r) => &mut r.caps,
            RequestPayload::Append(r) => &mut r.caps,
            RequestPayload::Scan(r) => &mut r.caps,
        };
        *slot = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ok_round_trips() {
        let env = Envelope::ok_value(Bytes::from_static(b"v1"));
        let decoded = Envelope::decode(env.encode()).unwrap();
        match decoded {
            Envelope::Ok { value, .. } => assert_eq!(value.unwrap(), Bytes::from_static(b"v1")),
            _ => panic!("expected ok"),
        }
    }

    #[test]
    fn envelope_err_round_trips() {
        let env = Envelope::err(ErrorCode::Timeout, "slow");
        let decoded = Envelope::decode(env.encode()).unwrap();
        match decoded {
            Envelope::Err { code, message } => {
                assert_eq!(code, ErrorCode::Timeout);
                assert_eq!(message, "slow");
            }
            _ => panic!("expected err"),
        }
    }

    #[test]
    fn put_request_round_trips_with_caps() {
        let req = RequestPayload::Put(PutRequest {
            key: Bytes::from_static(b"k1"),
            value: Bytes::from_static(b"v1"),
            caps: Some(Bytes::from_static(b"tok")),
        });
        let decoded = RequestPayload::decode(MethodId::Put, req.encode()).unwrap();
        match decoded {
            RequestPayload::Put(r) => {
                assert_eq!(r.key, Bytes::from_static(b"k1"));
                assert_eq!(r.value, Bytes::from_static(b"v1"));
                assert_eq!(r.caps.unwrap(), Bytes::from_static(b"tok"));
            }
            _ => panic!("expected put"),
        }
    }

    #[test]
    fn scan_request_caps_absent_stays_absent() {
        let req = RequestPayload::Scan(ScanRequest { prefix: Some(Bytes::from_static(b"p/")), ..Default::default() });
        let decoded = RequestPayload::decode(MethodId::Scan, req.encode()).unwrap();
        match decoded {
            RequestPayload::Scan(r) => {
                assert_eq!(r.prefix.unwrap(), Bytes::from_static(b"p/"));
                assert!(r.caps.is_none());
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn frame_round_trips() {
        let frame = Frame::Request { rid: 7, method: MethodId::Get, payload: Bytes::from_static(b"abc") };
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.rid(), 7);
    }

    #[test]
    fn truncated_frame_is_bad_payload() {
        let err = Frame::decode(Bytes::from_static(b"\x00\x01")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unknown);
    }
}
