//! Framing and message-header layer.

pub mod framing;
pub mod message;

pub use framing::{FrameBuffer, SizeHint, Sizer};
pub use message::{
    encode_message, flags, peer_sizer, MessageHeader, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};
