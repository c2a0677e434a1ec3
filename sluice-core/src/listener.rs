//! Listening sockets
//!
//! A [`Listener`] is owned by one event manager, which accepts on it when
//! it becomes readable. The pool keeps a [`ServerEntry`] per listener so
//! callers can look up addresses and stop listeners from any thread.

use crate::handler::AcceptCallback;
use mio::net::{TcpListener, TcpStream};
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Upper bound on accepts per readiness event, keeps one busy listener from
/// starving the manager's channels
pub const ACCEPT_BATCH: usize = 64;

/// Pool-unique listener identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directory record of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEntry {
    pub address: SocketAddr,
    pub owner: usize,
}

/// Outcome of one accept batch
#[derive(Debug, Default)]
pub struct Accepted {
    pub streams: Vec<(TcpStream, SocketAddr)>,
    pub errors: Vec<io::Error>,
}

/// A bound listener as held by its owning manager
pub struct Listener {
    id: ServerId,
    socket: TcpListener,
    address: SocketAddr,
    on_accept: AcceptCallback,
    token: usize,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Listener {
    pub fn new(id: ServerId, socket: TcpListener, address: SocketAddr, on_accept: AcceptCallback) -> Self {
        Self { id, socket, address, on_accept, token: 0 }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn socket(&self) -> &TcpListener {
        &self.socket
    }

    pub fn on_accept(&self) -> &AcceptCallback {
        &self.on_accept
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn set_token(&mut self, token: usize) {
        self.token = token;
    }

    /// Accept up to `max` pending connections
    ///
    /// Stops at WouldBlock. Per-connection failures (the peer reset before we
    /// accepted, descriptor exhaustion) are collected and end the batch.
    pub fn accept_batch(&self, max: usize) -> Accepted {
        let mut accepted = Accepted::default();

        while accepted.streams.len() < max {
            match self.socket.accept() {
                Ok(pair) => accepted.streams.push(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    accepted.errors.push(e);
                    break;
                }
            }
        }

        accepted
    }
}
