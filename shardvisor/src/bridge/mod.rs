//! Wire layer shared by the master and its shards.
//!
//! # Architecture
//!
//! - **codec**: 8-byte length-prefixed JSON framing
//! - **protocol**: Call/Result envelopes, the identification handshake, method names
//! - **channel**: call/response RPC over one framed connection

pub mod channel;
pub mod codec;
pub mod protocol;

pub use channel::{CallHandler, PendingReply, RpcChannel, RpcError};
pub use codec::{FrameCodec, FrameError, decode_frame, decode_frame_capped, encode_frame};
