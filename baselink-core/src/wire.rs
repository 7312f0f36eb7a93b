//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;

/// Hard cap on one frame. Base messages are small; anything near this size
/// is a misbehaving peer.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame. The transport delivers whole frames (the socket is
/// message-oriented), so a short or oversized buffer is a protocol error.
pub fn decode_frame(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() != LEN_SIZE + len {
        return Err(FrameDecodeError::Truncated);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..]).map_err(FrameDecodeError::Decode)?;
    Ok(msg)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("truncated frame")]
    Truncated,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
