//! RPC wire message header.
//!
//! Every RPC message starts with an 18-byte header:
//!
//! ```text
//! ┌────────────┬────────────┬──────────────┬────────────┬───────────┬─────────┐
//! │ Protocol ID│ Total size │ Proto version│ Message ID │ Sequence  │ Flags   │
//! │ 2 bytes    │ 4 bytes    │ 2 bytes      │ 4 bytes    │ 4 bytes   │ 2 bytes │
//! │ i16 LE     │ i32 LE     │ i16 LE       │ i32 LE     │ i32 LE    │ i16 LE  │
//! └────────────┴────────────┴──────────────┴────────────┴───────────┴─────────┘
//! ```
//!
//! followed by the codec-encoded payload. `total_size` counts the header
//! itself and is what the framing sizer reads to know how much to buffer.
//! Sequence 0 marks a notification (no correlated response expected).

use crate::error::{Result, WireError};
use crate::protocol::framing::SizeHint;

/// Header size in bytes (fixed, exactly 18).
pub const HEADER_SIZE: usize = 18;

/// Byte offset of the `total_size` field.
pub const SIZE_POS: usize = 2;

/// Default cap on a single frame. A claimed size beyond this is treated as
/// stream corruption.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Flag constants for the message header.
pub mod flags {
    /// The payload is an error message rather than a result.
    pub const IS_ERROR: i16 = 0x1;
    /// The message answers an earlier request with the same sequence.
    pub const IS_RESPONSE: i16 = 0x2;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: i16, flag: i16) -> bool {
        flags & flag != 0
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Application-chosen protocol discriminator.
    pub protocol_id: i16,
    /// Total message size including this header.
    pub total_size: i32,
    /// Protocol version negotiated out of band.
    pub protocol_version: i16,
    /// Identifies the payload's logical type (see [`crate::codec::wire_hash`]).
    pub message_id: i32,
    /// Correlation number; 0 = notification.
    pub sequence: i32,
    /// See the [`flags`] module.
    pub flags: i16,
}

impl MessageHeader {
    /// Create a header. `total_size` starts at 0 and is patched by
    /// [`encode_message`] once the payload length is known.
    pub fn new(protocol_id: i16, protocol_version: i16, message_id: i32, sequence: i32, flags: i16) -> Self {
        Self {
            protocol_id,
            total_size: 0,
            protocol_version,
            message_id,
            sequence,
            flags,
        }
    }

    /// Encode the header into `buf` (little endian).
    ///
    /// # Panics
    ///
    /// Panics if `buf` is smaller than [`HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.protocol_id.to_le_bytes());
        buf[2..6].copy_from_slice(&self.total_size.to_le_bytes());
        buf[6..8].copy_from_slice(&self.protocol_version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.message_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..18].copy_from_slice(&self.flags.to_le_bytes());
    }

    /// Decode a header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Protocol(format!(
                "frame shorter than header: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            protocol_id: i16::from_le_bytes([buf[0], buf[1]]),
            total_size: i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            protocol_version: i16::from_le_bytes([buf[6], buf[7]]),
            message_id: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            sequence: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            flags: i16::from_le_bytes([buf[16], buf[17]]),
        })
    }

    /// Check if the error flag is set.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    /// Check if this answers an earlier request.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    /// Check if this is a fire-and-forget notification.
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.sequence == 0
    }
}

/// Assemble a complete message: header, payload, then the back-patched
/// `total_size`.
pub fn encode_message(header: &MessageHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_SIZE];
    header.encode_into(&mut out);
    out.extend_from_slice(payload);

    let total = out.len() as i32;
    out[SIZE_POS..SIZE_POS + 4].copy_from_slice(&total.to_le_bytes());
    out
}

/// Sizing function for RPC framing: reads `total_size` once six bytes are
/// buffered. A size smaller than the header or beyond `max_frame` is
/// reported as corruption so the buffer resynchronizes.
pub fn peer_sizer(max_frame: usize) -> impl FnMut(&[u8]) -> SizeHint + Send {
    move |buf: &[u8]| {
        if buf.len() < SIZE_POS + 4 {
            return SizeHint::Partial;
        }

        let total = i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);

        if total < HEADER_SIZE as i32 || total as usize > max_frame {
            SizeHint::Corrupt
        } else {
            SizeHint::Frame(total as usize)
        }
    }
}
