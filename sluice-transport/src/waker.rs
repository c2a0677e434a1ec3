//! Cross-thread wake-up for a blocked multiplexer wait
//!
//! The owner thread registers the read end with its multiplexer under a
//! reserved id. Any thread may call [`Waker::wake`]; the pending `wait()`
//! returns with a readable event for that id and the owner calls
//! [`Waker::drain`] before processing its command queue.

use crate::mux::{Interest, Multiplexer};
use crate::Result;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

/// A non-blocking socket pair used to interrupt `Multiplexer::wait`
#[derive(Debug)]
pub struct Waker {
    reader: UnixStream,
    writer: UnixStream,
    /// Set between a wake and the matching drain; coalesces repeated wakes
    pending: AtomicBool,
}

impl Waker {
    pub fn new() -> Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer, pending: AtomicBool::new(false) })
    }

    /// Register the read end with `mux` under `id`
    pub fn register(&self, mux: &mut Multiplexer, id: usize) -> Result<()> {
        mux.register_fd(&self.reader, id, Interest::READABLE)
    }

    /// Wake the owner thread. Safe to call from any thread.
    pub fn wake(&self) -> Result<()> {
        if self.pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match (&self.writer).write(&[1u8]) {
            Ok(_) => Ok(()),
            // The pipe is full, so the owner is guaranteed to wake anyway
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.pending.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Consume all pending wake-ups. Called by the owner thread only, before
    /// it looks at its command queue: a wake coalesced into the current one
    /// enqueued its command before this point.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.pending.store(false, Ordering::Release);
    }
}
