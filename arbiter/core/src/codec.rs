//! JSON frame codec for the operator protocol

use thiserror::Error;

use crate::events::InboundEvent;
use crate::messages::OutboundEvent;

/// Largest inbound text frame accepted
pub const MAX_FRAME_BYTES: usize = 4096;

/// Frame decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame is not a known event
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame exceeds [`MAX_FRAME_BYTES`]
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Frame size
        size: usize,
        /// Limit
        limit: usize,
    },
}

/// Decode one inbound text frame
///
/// # Errors
///
/// Returns [`CodecError`] for oversized or unparseable frames.
pub fn decode_inbound(frame: &str) -> Result<InboundEvent, CodecError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge {
            size: frame.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(serde_json::from_str(frame)?)
}

/// Encode one outbound event as a text frame
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if serialization fails.
pub fn encode_outbound(event: &OutboundEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}
