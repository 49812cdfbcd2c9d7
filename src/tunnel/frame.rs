//! Control frame assembly
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                 Length (8B, signed, little endian)                    |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                     JSON payload (Length bytes)                       |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! Reads from the socket are appended to the assembler as they arrive. A read
//! may carry a fraction of a frame, exactly one frame, or several coalesced
//! frames; `next_frame` yields complete payloads one at a time and keeps
//! whatever follows for the next call.

use crate::protocol::{ProtocolError, LENGTH_PREFIX_SIZE};
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Where the assembler is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for the 8-byte length prefix
    AwaitingLength,
    /// Prefix consumed, waiting for this many payload bytes
    AwaitingBody(usize),
}

/// Reassembles length-prefixed frames from arbitrary read boundaries
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    state: ReadState,
    max_frame_size: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: ReadState::AwaitingLength,
            max_frame_size,
        }
    }

    /// Current read state
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Number of bytes held that do not yet form a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes from a read
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame payload, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            match self.state {
                ReadState::AwaitingLength => {
                    if self.buf.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let declared = self.buf.get_i64_le();
                    if declared < 0 {
                        return Err(ProtocolError::NegativeLength(declared));
                    }
                    let declared = declared as u64;
                    if declared > self.max_frame_size as u64 {
                        return Err(ProtocolError::FrameTooLarge(declared, self.max_frame_size));
                    }

                    self.state = ReadState::AwaitingBody(declared as usize);
                }
                ReadState::AwaitingBody(expected) => {
                    if self.buf.len() < expected {
                        return Ok(None);
                    }

                    let payload = self.buf.split_to(expected).freeze();
                    self.state = ReadState::AwaitingLength;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Hand back everything buffered as raw bytes and reset.
    ///
    /// Used when a connection stops speaking the control protocol and starts
    /// relaying, so bytes that arrived behind the last frame are not lost.
    pub fn take_remaining(&mut self) -> Bytes {
        self.state = ReadState::AwaitingLength;
        self.buf.split().freeze()
    }
}

/// Wrap a payload in the length-prefixed wire format
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_i64_le(payload.len() as i64);
    buf.extend_from_slice(payload);
    buf.freeze()
}
