//! Retry state machine of one outbound connect
//!
//! An attempt is one pass over the address list in order. A failing address
//! moves straight to the next one; when a whole pass failed the request
//! either waits `retry_interval` and starts over, or gives up after
//! `max_attempts` passes. The machine does no I/O; the connector thread
//! drives it with socket outcomes and timer expiries.

use crate::config::ConnectOptions;
use crate::{Error, Result};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Pool-unique connect request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// An address attempt is in flight
    Pending,
    /// Waiting for the retry interval before the next pass
    Retrying,
    Connected,
    Failed,
}

/// What the connector should do after an address failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Try this address now
    Connect(SocketAddr),
    /// Start the next pass after this delay
    Wait(Duration),
    /// Every attempt failed
    Exhausted,
}

#[derive(Debug)]
pub struct ConnectRequest {
    id: RequestId,
    addresses: Vec<SocketAddr>,
    options: ConnectOptions,
    index: usize,
    attempts_made: u32,
    state: RequestState,
    last_error: Option<io::Error>,
    /// Bumped on every address attempt and retry wait; timers carry the
    /// value they were scheduled with so stale ones can be told apart
    seq: u64,
}

impl ConnectRequest {
    pub fn new(id: RequestId, addresses: Vec<SocketAddr>, options: ConnectOptions) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::Config("connect needs at least one address".to_string()));
        }
        options.validate()?;

        Ok(Self {
            id,
            addresses,
            options,
            index: 0,
            attempts_made: 0,
            state: RequestState::Pending,
            last_error: None,
            seq: 0,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Address of the attempt in flight
    pub fn current(&self) -> SocketAddr {
        self.addresses[self.index]
    }

    /// Current pass, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Begin the first pass
    pub fn start(&mut self) -> SocketAddr {
        self.begin_pass()
    }

    /// The retry interval elapsed; begin the next pass
    pub fn retry(&mut self) -> SocketAddr {
        self.begin_pass()
    }

    fn begin_pass(&mut self) -> SocketAddr {
        self.state = RequestState::Pending;
        self.index = 0;
        self.seq += 1;
        self.current()
    }

    /// The current address failed with `error`
    pub fn address_failed(&mut self, error: io::Error) -> NextStep {
        self.last_error = Some(error);
        self.index += 1;
        self.seq += 1;

        if self.index < self.addresses.len() {
            return NextStep::Connect(self.current());
        }

        self.index = 0;
        self.attempts_made += 1;
        if self.attempts_made < self.options.max_attempts {
            self.state = RequestState::Retrying;
            NextStep::Wait(self.options.retry_interval)
        } else {
            self.state = RequestState::Failed;
            NextStep::Exhausted
        }
    }

    pub fn connected(&mut self) {
        self.state = RequestState::Connected;
    }

    /// Terminal error of an exhausted request
    pub fn failure(&mut self) -> Error {
        Error::ConnectFailure { attempts: self.attempts_made, last_error: self.last_error.take() }
    }
}
