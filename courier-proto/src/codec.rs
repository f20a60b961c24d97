//! Serialization for the Courier wire protocol.
//!
//! Every WebSocket binary frame carries exactly one postcard-encoded
//! [`ClientFrame`](crate::relay::ClientFrame) or
//! [`ServerFrame`](crate::relay::ServerFrame); WebSocket preserves message
//! boundaries, so no length prefix is added.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes a frame into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame from a byte slice using postcard.
///
/// Identifier fields are validated while decoding, so a frame carrying an
/// empty or malformed user ID fails here.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
