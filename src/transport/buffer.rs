//! Growable receive buffer for stream channels.

use tracing::debug;

use super::frame::{DecodedFrame, FrameDecoder};
use crate::core::{DecodeError, UNIT_BUFFER_SIZE};

/// Receive buffer with a decode cursor.
///
/// Bytes in `[cursor, filled)` are received but not yet decoded. When no
/// spare room is left the buffer is compacted to offset 0 if part of it has
/// been consumed, otherwise grown by [`UNIT_BUFFER_SIZE`].
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Vec<u8>,
    filled: usize,
    cursor: usize,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveBuffer {
    /// Create a buffer of one unit.
    pub fn new() -> Self {
        Self::with_capacity(UNIT_BUFFER_SIZE)
    }

    /// Create a buffer with a specific initial size.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            filled: 0,
            cursor: 0,
        }
    }

    /// Current allocated size.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received but not yet decoded.
    pub fn pending(&self) -> usize {
        self.filled - self.cursor
    }

    /// Writable space, compacting or growing first if there is none.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.filled == self.data.len() {
            if self.cursor > 0 {
                self.data.copy_within(self.cursor..self.filled, 0);
                self.filled -= self.cursor;
                self.cursor = 0;
            } else {
                let size = self.data.len() + UNIT_BUFFER_SIZE;
                debug!(size, "growing receive buffer");
                self.data.resize(size, 0);
            }
        }
        &mut self.data[self.filled..]
    }

    /// Mark `n` bytes of the spare space as filled.
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Copy `bytes` in, compacting or growing as needed.
    pub fn extend_from_slice(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let spare = self.spare_mut();
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            self.advance(n);
            bytes = &bytes[n..];
        }
    }

    /// Decode the next frame; the body is copied out of the buffer.
    pub fn decode_next(
        &mut self,
        decoder: &mut FrameDecoder,
    ) -> Result<Option<(DecodedFrame, Vec<u8>)>, DecodeError> {
        let filled = &self.data[..self.filled];
        match decoder.decode(filled, &mut self.cursor)? {
            Some(frame) => {
                let body = filled[frame.body.clone()].to_vec();
                if self.cursor == self.filled {
                    self.cursor = 0;
                    self.filled = 0;
                }
                Ok(Some((frame, body)))
            }
            None => Ok(None),
        }
    }

    /// Discard everything, keeping the allocation.
    pub fn clear(&mut self) {
        self.filled = 0;
        self.cursor = 0;
    }
}
