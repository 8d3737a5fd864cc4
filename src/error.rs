//! Error taxonomy shared by the channel layer, the RPC layer, and the pool.
//!
//! [`ErrorCode`] is the closed, wire-stable set from the RPC envelope format.
//! [`PlexError`] is the Rust-side error type used by fallible library APIs
//! that never cross the wire directly (transport setup, codec failures
//! before a route exists, pool exhaustion).

use std::fmt;

/// The closed set of error codes an [`crate::rpc::wire::Envelope`] failure
/// can carry. Senders must not invent new strings; receivers map any string
/// outside this set to [`ErrorCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadArg,
    CodecError,
    CasFailed,
    CapabilityDenied,
    Timeout,
    DriverError,
    CryptoError,
    NotAvailable,
    NotReady,
    PayloadTooLarge,
    Closed,
    Destroyed,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadArg => "BadArg",
            ErrorCode::CodecError => "CodecError",
            ErrorCode::CasFailed => "CASFailed",
            ErrorCode::CapabilityDenied => "CapabilityDenied",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::DriverError => "DriverError",
            ErrorCode::CryptoError => "CryptoError",
            ErrorCode::NotAvailable => "NotAvailable",
            ErrorCode::NotReady => "NotReady",
            ErrorCode::PayloadTooLarge => "PayloadTooLarge",
            ErrorCode::Closed => "Closed",
            ErrorCode::Destroyed => "Destroyed",
            ErrorCode::Unknown => "Unknown",
        }
    }

    /// Unknown wire strings fold into `Unknown` rather than erroring —
    /// this is what keeps the envelope format forward-compatible.
    pub fn parse(s: &str) -> ErrorCode {
        match s {
            "BadArg" => ErrorCode::BadArg,
            "CodecError" => ErrorCode::CodecError,
            "CASFailed" => ErrorCode::CasFailed,
            "CapabilityDenied" => ErrorCode::CapabilityDenied,
            "Timeout" => ErrorCode::Timeout,
            "DriverError" => ErrorCode::DriverError,
            "CryptoError" => ErrorCode::CryptoError,
            "NotAvailable" => ErrorCode::NotAvailable,
            "NotReady" => ErrorCode::NotReady,
            "PayloadTooLarge" => ErrorCode::PayloadTooLarge,
            "Closed" => ErrorCode::Closed,
            "Destroyed" => ErrorCode::Destroyed,
            _ => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rust-side error type for failures that happen before or outside an RPC
/// route — transport setup, channel pairing, codec decode, pool exhaustion.
/// Once a call has a route, failures are reported as wire envelopes instead
/// (see [`crate::error::ErrorCode`] and §7 of the design doc).
#[derive(Debug, thiserror::Error)]
pub enum PlexError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("multiplex substrate error: {0}")]
    Substrate(String),

    #[error("channel destroyed")]
    ChannelDestroyed,

    #[error("bad request payload")]
    BadPayload,

    #[error("payload of {len} bytes exceeds max of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("too many in-flight requests")]
    TooManyRoutes,

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("call destroyed: {0}")]
    Destroyed(String),

    #[error("peer pool: no peers available")]
    NoPeerAvailable,

    #[error("connection lost")]
    ConnectionLost,
}

impl PlexError {
    /// The error code this failure would carry if it were reported as a
    /// wire envelope rather than thrown/returned locally.
    pub fn code(&self) -> ErrorCode {
        match self {
            PlexError::Transport(_) => ErrorCode::DriverError,
            PlexError::Substrate(_) => ErrorCode::DriverError,
            PlexError::ChannelDestroyed => ErrorCode::Destroyed,
            PlexError::BadPayload => ErrorCode::Unknown,
            PlexError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            PlexError::TooManyRoutes => ErrorCode::NotReady,
            PlexError::Timeout(_) => ErrorCode::Timeout,
            PlexError::Destroyed(_) => ErrorCode::Destroyed,
            PlexError::NoPeerAvailable => ErrorCode::NotAvailable,
            PlexError::ConnectionLost => ErrorCode::Closed,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlexError>;
