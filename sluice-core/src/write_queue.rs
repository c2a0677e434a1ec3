//! Outbound byte queue of a channel
//!
//! Buffers are written strictly in FIFO order. A partial write leaves the
//! unwritten tail at the front, tracked by an offset into the first buffer.

use std::collections::VecDeque;
use std::io::{self, Write};

#[derive(Debug, Default)]
pub struct WriteQueue {
    buffers: VecDeque<Vec<u8>>,
    /// Bytes of the front buffer already written
    offset: usize,
    /// Unwritten bytes across all buffers
    len: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        self.len += buf.len();
        self.buffers.push_back(buf);
    }

    /// Unwritten bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unwritten part of the front buffer
    pub fn front(&self) -> Option<&[u8]> {
        self.buffers.front().map(|b| &b[self.offset..])
    }

    /// Mark `n` bytes from the front as written
    pub fn consume(&mut self, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;

        while n > 0 {
            let Some(front) = self.buffers.front() else { break };
            let remaining = front.len() - self.offset;
            if n >= remaining {
                n -= remaining;
                self.offset = 0;
                self.buffers.pop_front();
            } else {
                self.offset += n;
                n = 0;
            }
        }
    }

    /// Write as much as `writer` accepts
    ///
    /// Returns the bytes written. `WouldBlock` ends the attempt without error;
    /// `Interrupted` is retried. Any other error is returned and leaves the
    /// queue as it was after the last successful write.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while let Some(front) = self.front() {
            match writer.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.consume(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Drop every queued buffer, returning the discarded byte count
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.buffers.clear();
        self.offset = 0;
        self.len = 0;
        dropped
    }
}
