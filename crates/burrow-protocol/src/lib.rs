//! Wire protocol for the Burrow tunnel broker
//!
//! Every connection to the admin listener speaks newline-delimited JSON until
//! it either becomes a long-lived control channel or is switched to raw bytes
//! as a tunnel stream.

mod codec;
mod messages;

pub use codec::{CodecError, JsonLinesCodec, DEFAULT_MAX_LINE_LENGTH};
pub use messages::{
    AuthResult, ChannelOpen, ClientCommand, ServerCommand, ServerMessage, TunnelOpenResult,
};
