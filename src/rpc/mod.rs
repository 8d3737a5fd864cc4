//! RPC framing layer (§4.4–§4.6): wire codec, server dispatch, client proxy.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{AbortHandle, AbortReason, AbortSignal, CallOpts, RpcClient, ScanIter};
pub use server::{Handler, RpcServer, ScanStream};
pub use wire::{
    AppendRequest, DelRequest, Envelope, Frame, GetRequest, MethodId, PutRequest, Range, RequestPayload, ScanRequest,
};
