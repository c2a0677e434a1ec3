//! Non-blocking TCP socket helpers
//!
//! Listeners are created through `nix` so the accept backlog can be chosen
//! by the caller; the resulting socket is handed to mio. Outbound connects
//! use mio's non-blocking `connect`, completion is detected by the caller
//! through write readiness followed by [`finish_connect`].

use crate::{Error, Result};
use mio::net::{TcpListener, TcpStream};
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

/// Bind a non-blocking listening socket on `addr` with the given accept backlog
///
/// `SO_REUSEADDR` is set so a restarted server can rebind while old
/// connections linger in `TIME_WAIT`; an address held by another listener is
/// still rejected with `AddrInUse`.
pub fn bind_listener(addr: &SocketAddr, backlog: u32) -> Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(*addr))?;

    let backlog = i32::try_from(backlog)
        .map_err(|_| Error::Config(format!("listen backlog {backlog} out of range")))?;
    socket::listen(&fd, Backlog::new(backlog)?)?;

    let listener = std::net::TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener))
}

/// Start a non-blocking connect to `addr`
///
/// The returned stream is usually still connecting; register it for write
/// readiness and call [`finish_connect`] once it becomes writable.
pub fn start_connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    Ok(stream)
}

/// Outcome of checking a connecting stream after a readiness event
#[derive(Debug)]
pub enum ConnectStatus {
    /// The connection is established
    Connected,
    /// The connect has not completed yet (spurious wake-up)
    InProgress,
    /// The connect failed
    Failed(io::Error),
}

/// Check whether a connecting stream finished, successfully or not
pub fn finish_connect(stream: &TcpStream) -> ConnectStatus {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectStatus::Failed(e),
        Ok(None) => {}
    }

    match stream.peer_addr() {
        Ok(_) => ConnectStatus::Connected,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectStatus::InProgress,
        Err(e) => ConnectStatus::Failed(e),
    }
}

/// Apply the per-channel socket options used by the pool
pub fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    Ok(())
}
