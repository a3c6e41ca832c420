//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! Stream readers use [`payload_len`] on the header and [`decode_payload`] on the body;
//! [`decode_frame`] does both over an in-memory buffer.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
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

/// Payload length announced by a frame header. Rejects lengths above [`MAX_FRAME_LEN`].
pub fn payload_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body (without its header).
pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameDecodeError> {
    Ok(bincode::deserialize(payload)?)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// `NeedMore` means the buffer holds only part of a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some(header) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let mut len_bytes = [0u8; LEN_SIZE];
    len_bytes.copy_from_slice(header);
    let len = payload_len(len_bytes)?;
    let Some(body) = bytes.get(LEN_SIZE..LEN_SIZE + len) else {
        return Err(FrameDecodeError::NeedMore);
    };
    Ok((decode_payload(body)?, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
