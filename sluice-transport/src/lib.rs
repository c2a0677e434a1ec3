//! Sluice Transport Layer
//!
//! This crate provides the low-level socket plumbing for the sluice channel
//! pool: a readiness multiplexer with runtime-selectable backends, a
//! cross-thread waker that interrupts a blocked wait, and helpers for
//! non-blocking TCP listeners and outbound connects.
//!
//! ## I/O Multiplexer Selection
//!
//! The multiplexer backend can be selected at runtime:
//! - `Epoll`: Linux-only, most efficient for large numbers of connections
//! - `Poll`: Portable, no fd limit, good performance
//! - `Select`: Portable, but limited to ~1024 file descriptors
//! - `Mio`: Non-Linux platforms (kqueue on macOS/BSD)
//!
//! ## Example
//!
//! ```rust,no_run
//! use sluice_transport::mux::{Interest, Multiplexer, MultiplexerType};
//! use sluice_transport::{tcp, Waker};
//! use std::time::Duration;
//!
//! let mut mux = Multiplexer::new(MultiplexerType::default()).unwrap();
//! let waker = Waker::new().unwrap();
//! waker.register(&mut mux, usize::MAX).unwrap();
//!
//! let listener = tcp::bind_listener(&"127.0.0.1:0".parse().unwrap(), 128).unwrap();
//! mux.register_fd(&listener, 0, Interest::READABLE).unwrap();
//!
//! for event in mux.wait(Some(Duration::from_millis(100))).unwrap() {
//!     if event.id == usize::MAX {
//!         waker.drain();
//!     }
//! }
//! ```

use std::fmt;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport layer error types
#[derive(Debug)]
pub enum Error {
    /// I/O errors from transport layer
    Io(std::io::Error),

    /// Configuration errors
    Config(String),

    /// The selected backend cannot watch this descriptor
    FdOutOfRange { fd: std::os::fd::RawFd, limit: std::os::fd::RawFd },
}

impl Error {
    /// Whether this error is an interrupted system call that should be retried
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::Interrupted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::FdOutOfRange { fd, limit } => {
                write!(f, "fd {fd} is outside the multiplexer's range (0..{limit})")
            }
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(std::io::Error::from(err))
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

// =============================================================================
// Module declarations
// =============================================================================

pub mod mux;
pub mod tcp;
pub mod waker;

// =============================================================================
// Re-exports
// =============================================================================

pub use mux::{Event, Interest, Multiplexer, MultiplexerType};
pub use waker::Waker;
