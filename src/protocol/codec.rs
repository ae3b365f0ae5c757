//! Pluggable encoding of protocol envelopes
//!
//! The connection task only ever deals in text frames. A [`Codec`] decides how
//! a [`Message`] is rendered into that text and parsed back out of it.

use super::Message;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode/decode capability used by the outbound sender and the dispatcher
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<String, CodecError>;

    fn decode(&self, frame: &str) -> Result<Message, CodecError>;
}

/// Default codec: plain JSON text frames
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<String, CodecError> {
        serde_json::to_string(message).map_err(CodecError::Encode)
    }

    fn decode(&self, frame: &str) -> Result<Message, CodecError> {
        serde_json::from_str(frame).map_err(CodecError::Decode)
    }
}
