//! Framing buffer for accumulating partial reads.
//!
//! Turns a raw byte stream into discrete frames using a pluggable sizing
//! function. The buffer itself knows nothing about any particular wire
//! layout: the sizer inspects the currently buffered bytes and reports how
//! large the next complete frame is, that more data is needed, or that the
//! buffer is corrupted and must be discarded.
//!
//! Uses `bytes::BytesMut` so extracted frames are cheap slices.
//!
//! # Example
//!
//! ```
//! use wirepeer::protocol::{FrameBuffer, SizeHint};
//!
//! // Frames are [len:u8][payload...]
//! let mut buffer = FrameBuffer::new(Box::new(|buf: &[u8]| {
//!     if buf.is_empty() { SizeHint::Partial } else { SizeHint::Frame(1 + buf[0] as usize) }
//! }));
//!
//! buffer.push(&[3, b'a', b'b', b'c', 1]);
//! assert_eq!(&buffer.pop().unwrap()[..], &[3, b'a', b'b', b'c']);
//! assert!(buffer.pop().is_none()); // second frame still incomplete
//! ```

use bytes::{Bytes, BytesMut};

/// Verdict of a sizing function over the currently buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHint {
    /// The next complete frame is exactly this many bytes long. If more
    /// bytes than are currently buffered are named, the buffer keeps
    /// accumulating until they arrive.
    Frame(usize),
    /// Not enough data yet to tell.
    Partial,
    /// The buffered bytes cannot be a valid frame; discard everything and
    /// resynchronize on the next reads.
    Corrupt,
}

/// Pluggable frame-sizing function.
///
/// Called with the buffered bytes on every pop, and with an empty slice on
/// [`FrameBuffer::reset`] so stateful sizers (e.g. ones tracking nesting
/// depth) can clear their own state.
pub type Sizer = Box<dyn FnMut(&[u8]) -> SizeHint + Send>;

/// Buffer that accumulates incoming bytes and extracts complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    sizer: Sizer,
}

impl FrameBuffer {
    /// Create a framing buffer around the given sizer.
    pub fn new(sizer: Sizer) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            sizer,
        }
    }

    /// Append newly read bytes.
    pub fn push(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `None` while the sizer reports insufficient data. When the
    /// sizer reports corruption the whole buffer is discarded so a later
    /// well-formed frame can align again.
    pub fn pop(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }

        match (self.sizer)(&self.buffer) {
            SizeHint::Frame(n) if n > 0 && n <= self.buffer.len() => {
                Some(self.buffer.split_to(n).freeze())
            }
            SizeHint::Frame(_) | SizeHint::Partial => None,
            SizeHint::Corrupt => {
                tracing::warn!(len = self.buffer.len(), "corrupted frame buffer, resyncing");
                self.reset();
                None
            }
        }
    }

    /// Clear buffered bytes and probe the sizer with an empty slice.
    pub fn reset(&mut self) {
        self.buffer.clear();
        let _ = (self.sizer)(&[]);
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
