//! Common error types for Callmesh components.

use thiserror::Error;

/// Errors raised while encoding or decoding signaling frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Frame is not valid JSON or names an unknown event
    #[error("Decode error: {0}")]
    Decode(String),
}
