//! Payload framing for the byte-oriented channels.
//!
//! The pipe and the shared memory mailbox carry either raw NUL-terminated
//! text ([`Framing::Raw`]) or length-prefixed frames
//! ([`Framing::LengthPrefixed`]):
//!
//! ```text
//! +----------------+----------------+---------------------------+
//! |  Length (u16, little-endian)    |  Payload (Length bytes)   |
//! +----------------+----------------+---------------------------+
//! ```
//!
//! Length-prefixed frames survive the coalescing and splitting a FIFO
//! performs, and can carry ciphertext that contains NUL bytes.
//!
//! [`Framing::Raw`]: shared_utils::config::Framing::Raw
//! [`Framing::LengthPrefixed`]: shared_utils::config::Framing::LengthPrefixed

use crate::error::{ChannelError, ChannelResult};
use crate::message::MAX_MESSAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

/// Size of the length header in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Encode one length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> ChannelResult<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ChannelError::MalformedPayload(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let mut buffer = vec![0u8; LENGTH_PREFIX_SIZE + payload.len()];
    LittleEndian::write_u16(&mut buffer[..LENGTH_PREFIX_SIZE], payload.len() as u16);
    buffer[LENGTH_PREFIX_SIZE..].copy_from_slice(payload);
    Ok(buffer)
}

/// Reassembles length-prefixed frames from arbitrarily chunked reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes of a frame that has not fully arrived yet
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every frame payload completed by it.
    ///
    /// A header announcing more than [`MAX_MESSAGE_SIZE`] bytes means the
    /// stream is out of sync; the buffer is discarded and an error returned.
    pub fn decode(&mut self, data: &[u8]) -> ChannelResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < LENGTH_PREFIX_SIZE {
                break;
            }
            let len = LittleEndian::read_u16(&self.buffer[..LENGTH_PREFIX_SIZE]) as usize;
            if len > MAX_MESSAGE_SIZE {
                let buffered = self.buffer.len();
                self.buffer.clear();
                return Err(ChannelError::MalformedPayload(format!(
                    "frame header announces {len} bytes (max {MAX_MESSAGE_SIZE}); dropped {buffered} buffered bytes"
                )));
            }
            let total = LENGTH_PREFIX_SIZE + len;
            if self.buffer.len() < total {
                break;
            }
            frames.push(self.buffer[LENGTH_PREFIX_SIZE..total].to_vec());
            self.buffer.drain(..total);
        }

        trace!(
            frames = frames.len(),
            remaining = self.buffer.len(),
            "Decoded pipe frames"
        );
        Ok(frames)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Content of a raw region: the bytes before the first NUL, or `None` when
/// the region is empty.
pub fn read_c_string(region: &[u8]) -> Option<&[u8]> {
    let end = region.iter().position(|&b| b == 0).unwrap_or(region.len());
    if end == 0 {
        None
    } else {
        Some(&region[..end])
    }
}

/// Content of a length-prefixed region; `None` when the length is zero.
pub fn read_length_prefixed(region: &[u8]) -> ChannelResult<Option<&[u8]>> {
    if region.len() < LENGTH_PREFIX_SIZE {
        return Err(ChannelError::MalformedPayload(
            "region too small for a length header".to_string(),
        ));
    }
    let len = LittleEndian::read_u16(&region[..LENGTH_PREFIX_SIZE]) as usize;
    if len == 0 {
        return Ok(None);
    }
    let available = region.len() - LENGTH_PREFIX_SIZE;
    if len > available || len > MAX_MESSAGE_SIZE {
        return Err(ChannelError::MalformedPayload(format!(
            "region header announces {len} bytes but only {} fit",
            available.min(MAX_MESSAGE_SIZE)
        )));
    }
    Ok(Some(&region[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len]))
}

/// Store `bytes` as a NUL-terminated string at the start of `region`.
pub fn write_c_string(region: &mut [u8], bytes: &[u8]) -> ChannelResult<()> {
    if bytes.contains(&0) {
        return Err(ChannelError::MalformedPayload(
            "payload contains a NUL byte; use length-prefixed framing".to_string(),
        ));
    }
    if bytes.len() + 1 > region.len() {
        return Err(ChannelError::MalformedPayload(format!(
            "payload of {} bytes does not fit a {} byte region",
            bytes.len(),
            region.len()
        )));
    }
    region[..bytes.len()].copy_from_slice(bytes);
    region[bytes.len()] = 0;
    Ok(())
}

/// Store `bytes` behind a length header at the start of `region`.
pub fn write_length_prefixed(region: &mut [u8], bytes: &[u8]) -> ChannelResult<()> {
    if bytes.len() + LENGTH_PREFIX_SIZE > region.len() {
        return Err(ChannelError::MalformedPayload(format!(
            "payload of {} bytes does not fit a {} byte region",
            bytes.len(),
            region.len()
        )));
    }
    let frame = encode_frame(bytes)?;
    region[..frame.len()].copy_from_slice(&frame);
    Ok(())
}
