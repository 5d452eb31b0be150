/*
    codec.rs - JSON framing for protocol messages

    One frame carries one `ChannelMsg`, serialized as a JSON object tagged by
    "type". Frames above MAX_FRAME_SIZE are refused in both directions.
*/

use super::errors::CodecError;
use crate::core_sync::ChannelMsg;

/// Maximum encoded frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub fn encode(message: &ChannelMsg) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<ChannelMsg, CodecError> {
    // Check size before parsing
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
