//! Wire framing.
//!
//! A message on the wire is one `# ... !` delimited byte span. Between
//! the delimiters sits a fixed 12-byte little-endian header followed by
//! a variable payload:
//!
//! ```text
//! offset  field     size
//!      0  flag        4   (u32 LE)
//!      4  command     2   (u16 LE)
//!      6  param1      2   (u16 LE)
//!      8  param2      2   (u16 LE)
//!     10  param3      2   (u16 LE)
//!     12  payload     frame length minus header
//! ```
//!
//! A span lacking either delimiter is incomplete, not an error: the
//! scanner waits for more data. Malformed spans (shorter than the
//! header) are discarded without touching the connection.

use bytes::{Buf, BytesMut};

/// Frame start delimiter.
pub const FRAME_START: u8 = b'#';
/// Frame end delimiter.
pub const FRAME_END: u8 = b'!';
/// Fixed header size between the delimiters.
pub const HEADER_LEN: usize = 12;

/// Cap on a single frame span. Anything longer is treated as garbage
/// and skipped so one bad client cannot grow the buffer without bound.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame span too short for header: {len} bytes")]
    SpanTooShort { len: usize },
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: u32,
    pub command: u16,
    pub param1: u16,
    pub param2: u16,
    pub param3: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u16) -> Self {
        Self {
            flag: 0,
            command,
            param1: 0,
            param2: 0,
            param3: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_params(command: u16, p1: u16, p2: u16, p3: u16) -> Self {
        Self {
            param1: p1,
            param2: p2,
            param3: p3,
            ..Self::new(command)
        }
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Decode one span (the bytes between `#` and `!`, exclusive).
    pub fn decode(span: &[u8]) -> Result<Frame, FrameError> {
        if span.len() < HEADER_LEN {
            return Err(FrameError::SpanTooShort { len: span.len() });
        }
        Ok(Frame {
            flag: u32::from_le_bytes([span[0], span[1], span[2], span[3]]),
            command: u16::from_le_bytes([span[4], span[5]]),
            param1: u16::from_le_bytes([span[6], span[7]]),
            param2: u16::from_le_bytes([span[8], span[9]]),
            param3: u16::from_le_bytes([span[10], span[11]]),
            payload: span[HEADER_LEN..].to_vec(),
        })
    }

    /// Encode including both delimiters.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + 2);
        out.push(FRAME_START);
        out.extend_from_slice(&self.flag.to_le_bytes());
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.param1.to_le_bytes());
        out.extend_from_slice(&self.param2.to_le_bytes());
        out.extend_from_slice(&self.param3.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.push(FRAME_END);
        out
    }
}

/// Incremental scanner over a connection's inbound byte stream.
///
/// Consumes exactly one complete `# ... !` span per [`next_frame`] call
/// and leaves any trailing partial data buffered for the next read.
///
/// [`next_frame`]: FrameScanner::next_frame
#[derive(Default)]
pub struct FrameScanner {
    buf: BytesMut,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the accumulation buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered (unconsumed).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// Garbage before the next `#` and malformed spans are discarded
    /// with a debug log; the connection is never failed from here.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            // Resynchronize on the next start marker.
            match self.buf.iter().position(|&b| b == FRAME_START) {
                Some(0) => {}
                Some(n) => {
                    tracing::debug!("[world] [frame] skipping {} garbage bytes", n);
                    self.buf.advance(n);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            let end = match self.buf[1..].iter().position(|&b| b == FRAME_END) {
                Some(i) => 1 + i,
                None => {
                    // Incomplete span; bound the wait.
                    if self.buf.len() > MAX_FRAME_LEN {
                        tracing::debug!(
                            "[world] [frame] oversized span ({} bytes), resyncing",
                            self.buf.len()
                        );
                        self.buf.advance(1);
                        continue;
                    }
                    return None;
                }
            };

            let span = self.buf[1..end].to_vec();
            self.buf.advance(end + 1);

            match Frame::decode(&span) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::debug!("[world] [frame] discarding malformed span: {}", e);
                    continue;
                }
            }
        }
    }
}
