//! Tunlify Protocol Definitions
//!
//! This crate defines the messages exchanged between the relay and a tunnel
//! client over the persistent client channel, and the JSON codec that frames
//! them (one JSON object per channel message).

pub mod codec;
pub mod messages;

pub use codec::{
    check_encodable, decode, decode_body, encode, encode_body, encoded_len, CodecError,
};
pub use messages::*;

/// Path the tunnel client connects to
pub const CLIENT_CHANNEL_PATH: &str = "/ws/tunnel";

/// Maximum encoded message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
