//! Connector thread: drives outbound connect requests
//!
//! Connect requests are not owned by any event manager. The connector keeps
//! the in-flight sockets in its own multiplexer, applies per-address timeouts
//! and retry waits from its timer queue, and hands each established socket to
//! the pool, which assigns it to the least-loaded manager.

pub mod request;

pub use request::{ConnectRequest, NextStep, RequestId, RequestState};

use crate::handler::{ConnectCallback, PoolEvent};
use crate::event_manager::Origin;
use crate::pool::{ChannelPool, WAKER_TOKEN};
use crate::timer::TimerQueue;
use crate::Error;
use crossbeam_channel::{Receiver, TryRecvError};
use mio::net::TcpStream;
use sluice_transport::tcp::{self, ConnectStatus};
use sluice_transport::{Interest, Multiplexer, Waker};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) enum ConnectorCommand {
    Connect { request: ConnectRequest, on_result: ConnectCallback },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum ConnectorTimer {
    /// The address attempt started with `seq` ran out of time
    AddressTimeout { request: RequestId, seq: u64 },
    /// The retry wait scheduled with `seq` elapsed
    Retry { request: RequestId, seq: u64 },
}

struct InFlight {
    request: ConnectRequest,
    on_result: ConnectCallback,
    socket: Option<TcpStream>,
}

pub(crate) struct Connector {
    mux: Multiplexer,
    waker: Arc<Waker>,
    rx: Receiver<ConnectorCommand>,
    pool: ChannelPool,
    requests: HashMap<RequestId, InFlight>,
    timers: TimerQueue<ConnectorTimer>,
    poll_interval: Duration,
}

impl Connector {
    pub(crate) fn new(mux: Multiplexer, waker: Arc<Waker>, rx: Receiver<ConnectorCommand>, pool: ChannelPool) -> Self {
        let poll_interval = pool.config().poll_interval;
        Self { mux, waker, rx, pool, requests: HashMap::new(), timers: TimerQueue::new(), poll_interval }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("connector started");

        'outer: loop {
            let timeout = self.timers.timeout(Instant::now(), self.poll_interval);
            let events = match self.mux.wait(Some(timeout)) {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!("connector multiplexer failed: {e}");
                    break;
                }
            };

            for event in events {
                if event.id == WAKER_TOKEN {
                    self.waker.drain();
                } else {
                    self.on_ready(RequestId(event.id as u64));
                }
            }

            loop {
                match self.rx.try_recv() {
                    Ok(ConnectorCommand::Connect { request, on_result }) => self.begin(request, on_result),
                    Ok(ConnectorCommand::Shutdown) => break 'outer,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            for timer in self.timers.drain_expired(Instant::now()) {
                self.on_timer(timer);
            }
        }

        self.cancel_all();
        tracing::debug!("connector stopped");
    }

    fn begin(&mut self, mut request: ConnectRequest, on_result: ConnectCallback) {
        let id = request.id();
        let address = request.start();
        self.requests.insert(id, InFlight { request, on_result, socket: None });
        self.try_address(id, address);
    }

    /// Start a non-blocking connect to `address`, moving on to the next
    /// address for as long as connects fail synchronously
    fn try_address(&mut self, id: RequestId, mut address: SocketAddr) {
        loop {
            tracing::debug!(request = %id, %address, "connecting");
            let err = match tcp::start_connect(address) {
                Ok(stream) => match self.mux.register_fd(&stream, id.0 as usize, Interest::WRITABLE) {
                    Ok(()) => {
                        let Some(flight) = self.requests.get_mut(&id) else { return };
                        let timeout = flight.request.options().timeout;
                        let seq = flight.request.seq();
                        flight.socket = Some(stream);
                        self.timers.schedule_after(timeout, ConnectorTimer::AddressTimeout { request: id, seq });
                        return;
                    }
                    Err(e) => transport_to_io(e),
                },
                Err(e) => transport_to_io(e),
            };

            match self.address_failed(id, err) {
                Some(next) => address = next,
                None => return,
            }
        }
    }

    /// Record a failed address; returns the next address to try right away
    fn address_failed(&mut self, id: RequestId, err: io::Error) -> Option<SocketAddr> {
        let flight = self.requests.get_mut(&id)?;
        if let Some(stream) = flight.socket.take() {
            let _ = self.mux.deregister_fd(&stream);
        }

        let address = flight.request.current();
        let attempt = flight.request.attempt();
        let kind = err.kind();
        tracing::debug!(request = %id, %address, attempt, "connect attempt failed: {err}");

        let step = flight.request.address_failed(err);
        let seq = flight.request.seq();

        let event = PoolEvent::ConnectAttemptFailed { request_id: id, address, attempt, error: kind };
        self.pool.handler().on_pool_event(&self.pool, &event);

        match step {
            NextStep::Connect(next) => Some(next),
            NextStep::Wait(delay) => {
                tracing::debug!(request = %id, delay = ?delay, "retrying after interval");
                self.timers.schedule_after(delay, ConnectorTimer::Retry { request: id, seq });
                None
            }
            NextStep::Exhausted => {
                let mut flight = self.requests.remove(&id)?;
                let err = flight.request.failure();
                tracing::debug!(request = %id, "connect failed: {err}");
                self.pool.finish_request(id);
                (flight.on_result)(&self.pool, id, Err(err));
                None
            }
        }
    }

    fn on_ready(&mut self, id: RequestId) {
        let Some(flight) = self.requests.get_mut(&id) else { return };
        let Some(stream) = flight.socket.as_ref() else { return };

        match tcp::finish_connect(stream) {
            ConnectStatus::InProgress => {}
            ConnectStatus::Connected => {
                let Some(stream) = flight.socket.take() else { return };
                let _ = self.mux.deregister_fd(&stream);
                flight.request.connected();

                let Some(flight) = self.requests.remove(&id) else { return };
                tracing::debug!(request = %id, address = %flight.request.current(), "connected");
                self.pool.finish_request(id);
                let origin = Origin::Connected { request: id, on_result: flight.on_result };
                self.pool.place_channel(stream, origin);
            }
            ConnectStatus::Failed(err) => {
                if let Some(next) = self.address_failed(id, err) {
                    self.try_address(id, next);
                }
            }
        }
    }

    fn on_timer(&mut self, timer: ConnectorTimer) {
        match timer {
            ConnectorTimer::AddressTimeout { request, seq } => {
                let current = self.requests.get(&request).is_some_and(|f| {
                    f.request.seq() == seq && f.request.state() == RequestState::Pending && f.socket.is_some()
                });
                if !current {
                    return;
                }
                let err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                if let Some(next) = self.address_failed(request, err) {
                    self.try_address(request, next);
                }
            }
            ConnectorTimer::Retry { request, seq } => {
                let Some(flight) = self.requests.get_mut(&request) else { return };
                if flight.request.seq() != seq || flight.request.state() != RequestState::Retrying {
                    return;
                }
                let address = flight.request.retry();
                self.try_address(request, address);
            }
        }
    }

    /// Fail every pending request with `Error::Shutdown`
    fn cancel_all(&mut self) {
        self.timers.clear();
        let pending: Vec<_> = self.requests.drain().collect();
        for (id, flight) in pending {
            if let Some(stream) = flight.socket.as_ref() {
                let _ = self.mux.deregister_fd(stream);
            }
            self.pool.finish_request(id);
            (flight.on_result)(&self.pool, id, Err(Error::Shutdown));
        }

        // Requests queued behind the shutdown command
        while let Ok(cmd) = self.rx.try_recv() {
            if let ConnectorCommand::Connect { request, on_result } = cmd {
                let id = request.id();
                self.pool.finish_request(id);
                on_result(&self.pool, id, Err(Error::Shutdown));
            }
        }
    }
}

fn transport_to_io(err: sluice_transport::Error) -> io::Error {
    match err {
        sluice_transport::Error::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}
