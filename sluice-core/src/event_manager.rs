//! Event manager: one readiness loop per pool thread
//!
//! Each manager owns a multiplexer, a disjoint set of channels and the
//! listeners assigned to it. Other threads talk to it only through its
//! command queue; everything that touches a channel's socket or buffers, and
//! every callback for that channel, happens on the manager's own thread.
//!
//! One loop iteration:
//!
//! ```text
//! wait (≤ poll_interval, ≤ next timer)
//!   ├── waker        -> drain
//!   ├── listener     -> accept batch -> ChannelPool::place_channel
//!   └── channel      -> one read + on_data / flush write queue
//! apply queued commands
//! fire expired timers (clocks, shutdown grace)
//! ```

use crate::channel::{Channel, ChannelAlert, ChannelId, ChannelShared, ChannelState, StateReason};
use crate::clock::{Clock, ClockId};
use crate::connector::RequestId;
use crate::handler::{AcceptCallback, ChannelHandler, ConnectCallback, PoolEvent};
use crate::listener::{Listener, ServerId, ACCEPT_BATCH};
use crate::pool::{ChannelPool, WAKER_TOKEN};
use crate::timer::TimerQueue;
use crate::Error;
use crossbeam_channel::{Receiver, TryRecvError};
use mio::net::TcpStream;
use sluice_transport::{tcp, Event, Interest, Multiplexer, Waker};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a channel came to exist
pub(crate) enum Origin {
    Accepted { server: ServerId, peer: SocketAddr, on_accept: AcceptCallback },
    Connected { request: RequestId, on_result: ConnectCallback },
    Imported,
}

impl Origin {
    fn reason(&self) -> StateReason {
        match self {
            Origin::Accepted { .. } => StateReason::Accepted,
            Origin::Connected { .. } => StateReason::Established,
            Origin::Imported => StateReason::Imported,
        }
    }
}

/// Requests from other threads to a manager
pub(crate) enum Command {
    /// Take ownership of a freshly registered channel
    Adopt { channel: ChannelId, stream: TcpStream, shared: Arc<ChannelShared>, origin: Origin },
    /// Queue outbound bytes; `high_water` when this send crossed the mark
    Write { channel: ChannelId, data: Vec<u8>, high_water: bool },
    /// A send was rejected for backpressure
    Backpressure(ChannelId),
    Close { channel: ChannelId, graceful: bool },
    EnableRead(ChannelId),
    DisableRead(ChannelId),
    /// Watermarks changed; re-evaluate the low-water alert
    Recheck(ChannelId),
    Listen { listener: Listener },
    StopListen(ServerId),
    AddClock(Clock),
    RemoveClock(ClockId),
    Shutdown { grace: Duration },
}

impl Command {
    /// The pending origin of an undelivered Adopt
    pub(crate) fn into_origin(self) -> Option<Origin> {
        match self {
            Command::Adopt { origin, .. } => Some(origin),
            _ => None,
        }
    }
}

/// What a multiplexer id refers to
#[derive(Debug, Clone, Copy)]
enum Token {
    Channel(ChannelId),
    Listener(ServerId),
}

#[derive(Debug, Clone, Copy)]
enum ManagerTimer {
    Clock(ClockId),
    /// Shutdown grace expired; close whatever is left
    ForceClose,
}

pub(crate) struct EventManager {
    index: usize,
    mux: Multiplexer,
    waker: Arc<Waker>,
    rx: Receiver<Command>,
    pool: ChannelPool,
    handler: Arc<dyn ChannelHandler>,
    channels: HashMap<ChannelId, Channel>,
    listeners: HashMap<ServerId, Listener>,
    clocks: HashMap<ClockId, Clock>,
    tokens: HashMap<usize, Token>,
    next_token: usize,
    timers: TimerQueue<ManagerTimer>,
    read_chunk_size: usize,
    read_high_water_mark: usize,
    poll_interval: Duration,
    stopping: bool,
}

impl EventManager {
    pub(crate) fn new(
        index: usize,
        mux: Multiplexer,
        waker: Arc<Waker>,
        rx: Receiver<Command>,
        pool: ChannelPool,
    ) -> Self {
        let config = pool.config();
        Self {
            index,
            read_chunk_size: config.read_chunk_size,
            read_high_water_mark: config.read_high_water_mark,
            poll_interval: config.poll_interval,
            handler: pool.handler().clone(),
            mux,
            waker,
            rx,
            pool,
            channels: HashMap::new(),
            listeners: HashMap::new(),
            clocks: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            timers: TimerQueue::new(),
            stopping: false,
        }
    }

    /// Run until shutdown completes or the multiplexer fails
    pub(crate) fn run(mut self) {
        tracing::debug!(manager = self.index, multiplexer = %self.mux.mux_type(), "event manager started");

        loop {
            let timeout = self.timers.timeout(Instant::now(), self.poll_interval);
            let events = match self.mux.wait(Some(timeout)) {
                Ok(events) => events,
                Err(e) => {
                    self.fault(e);
                    return;
                }
            };

            for event in events {
                self.dispatch(event);
            }
            self.process_commands();
            self.fire_timers();
            // The waker is always registered
            self.pool.counters().set_registrations(self.index, self.mux.len().saturating_sub(1));

            if self.stopping && self.channels.is_empty() {
                break;
            }
        }

        self.exit(Error::Shutdown);
        tracing::debug!(manager = self.index, "event manager stopped");
    }

    fn dispatch(&mut self, event: Event) {
        if event.id == WAKER_TOKEN {
            self.waker.drain();
            return;
        }

        // Unknown ids belong to sockets removed earlier in this iteration
        match self.tokens.get(&event.id).copied() {
            Some(Token::Listener(server)) => self.on_acceptable(server),
            Some(Token::Channel(channel)) => {
                if event.readable {
                    self.on_readable(channel);
                }
                if event.writable {
                    self.flush(channel);
                }
            }
            None => tracing::trace!(manager = self.index, token = event.id, "stale event"),
        }
    }

    fn alloc_token(&mut self, token: Token) -> usize {
        let id = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        if self.next_token == WAKER_TOKEN {
            self.next_token = 0;
        }
        self.tokens.insert(id, token);
        id
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    fn process_commands(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(cmd) => self.apply(cmd),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Adopt { channel, stream, shared, origin } => self.adopt(channel, stream, shared, origin),
            Command::Write { channel, data, high_water } => {
                let Some(ch) = self.channels.get_mut(&channel) else { return };
                ch.enqueue(data);
                if high_water && ch.arm_low_water() {
                    self.alert(channel, ChannelAlert::HighWater);
                }
                self.flush(channel);
            }
            Command::Backpressure(channel) => {
                let Some(ch) = self.channels.get_mut(&channel) else { return };
                if ch.arm_low_water() {
                    self.alert(channel, ChannelAlert::HighWater);
                }
                self.check_low_water(channel);
            }
            Command::Recheck(channel) => self.check_low_water(channel),
            Command::Close { channel, graceful } => self.close(channel, graceful, StateReason::LocalClose),
            Command::EnableRead(channel) => self.enable_read(channel),
            Command::DisableRead(channel) => {
                let Some(ch) = self.channels.get_mut(&channel) else { return };
                ch.set_read_enabled(false);
                self.sync_interest(channel);
                self.alert(channel, ChannelAlert::ReadDisabled);
            }
            Command::Listen { listener } => self.add_listener(listener),
            Command::StopListen(server) => self.remove_listener(server),
            Command::AddClock(clock) => self.add_clock(clock),
            Command::RemoveClock(clock) => {
                self.clocks.remove(&clock);
            }
            Command::Shutdown { grace } => self.begin_shutdown(grace),
        }
    }

    fn adopt(&mut self, id: ChannelId, stream: TcpStream, shared: Arc<ChannelShared>, origin: Origin) {
        if self.stopping {
            self.pool.release_channel(id);
            if matches!(origin, Origin::Imported) {
                self.handler.on_channel_state(
                    &self.pool,
                    id,
                    ChannelState::Connecting,
                    ChannelState::Closed,
                    StateReason::Shutdown,
                );
            }
            self.pool.reject(origin, Error::Shutdown);
            return;
        }

        if let Err(e) = tcp::configure_stream(&stream) {
            tracing::debug!(channel = %id, "failed to configure socket: {e}");
        }
        let (peer, local) = match stream.peer_addr().and_then(|p| Ok((p, stream.local_addr()?))) {
            Ok(pair) => pair,
            Err(e) => {
                self.pool.release_channel(id);
                self.pool.reject(origin, Error::Io(e));
                return;
            }
        };

        let token = self.alloc_token(Token::Channel(id));
        let mut channel = Channel::new(id, token, stream, peer, local, shared);
        channel.set_state(ChannelState::Connected);
        self.channels.insert(id, channel);

        if let Err(e) = self.try_sync_interest(id) {
            self.tokens.remove(&token);
            self.channels.remove(&id);
            self.pool.release_channel(id);
            self.pool.reject(origin, e.into());
            return;
        }

        tracing::debug!(manager = self.index, channel = %id, %peer, "channel up");
        self.handler.on_channel_state(
            &self.pool,
            id,
            ChannelState::Connecting,
            ChannelState::Connected,
            origin.reason(),
        );

        match origin {
            Origin::Accepted { server, peer, on_accept } => on_accept(&self.pool, server, id, peer),
            Origin::Connected { request, on_result } => on_result(&self.pool, request, Ok(id)),
            Origin::Imported => {}
        }
    }

    fn enable_read(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else { return };
        ch.set_read_enabled(true);
        ch.set_read_suspended(false);
        self.alert(id, ChannelAlert::ReadEnabled);
        // Re-offer what was left unconsumed; this may suspend reading again
        self.deliver(id);
        self.sync_interest(id);
    }

    // ---------------------------------------------------------------------
    // Listeners
    // ---------------------------------------------------------------------

    fn add_listener(&mut self, mut listener: Listener) {
        let server = listener.id();
        if self.stopping {
            self.pool.forget_server(server);
            return;
        }

        let token = self.alloc_token(Token::Listener(server));
        listener.set_token(token);
        if let Err(e) = self.mux.register_fd(listener.socket(), token, Interest::READABLE) {
            tracing::warn!(manager = self.index, server = %server, "cannot watch listener: {e}");
            self.tokens.remove(&token);
            self.pool.forget_server(server);
            return;
        }

        tracing::debug!(manager = self.index, server = %server, address = %listener.address(), "listener added");
        self.listeners.insert(server, listener);
    }

    fn remove_listener(&mut self, server: ServerId) {
        if let Some(listener) = self.listeners.remove(&server) {
            self.tokens.remove(&listener.token());
            if let Err(e) = self.mux.deregister_fd(listener.socket()) {
                tracing::debug!(server = %server, "deregister listener: {e}");
            }
        }
    }

    fn on_acceptable(&mut self, server: ServerId) {
        let Some(listener) = self.listeners.get(&server) else { return };
        let batch = listener.accept_batch(ACCEPT_BATCH);
        let on_accept = listener.on_accept().clone();

        for (stream, peer) in batch.streams {
            tracing::trace!(server = %server, %peer, "accepted");
            let origin = Origin::Accepted { server, peer, on_accept: on_accept.clone() };
            self.pool.place_channel(stream, origin);
        }

        for e in batch.errors {
            tracing::warn!(manager = self.index, server = %server, "accept failed: {e}");
            let event = PoolEvent::AcceptFailed { server_id: server, error: e.kind() };
            self.handler.on_pool_event(&self.pool, &event);
        }
    }

    // ---------------------------------------------------------------------
    // Clocks
    // ---------------------------------------------------------------------

    fn add_clock(&mut self, clock: Clock) {
        let id = clock.id();
        if self.stopping || clock.is_cancelled() {
            self.pool.release_clock(id);
            return;
        }
        self.timers.schedule(clock.due(), ManagerTimer::Clock(id));
        self.clocks.insert(id, clock);
    }

    /// Run a due clock; a removed clock leaves a stale timer that is ignored
    fn fire_clock(&mut self, id: ClockId) {
        let Some(clock) = self.clocks.get_mut(&id) else { return };
        if clock.is_cancelled() {
            self.clocks.remove(&id);
            return;
        }

        tracing::trace!(manager = self.index, clock = %id, "clock fired");
        (clock.callback())(&self.pool, id);

        // The callback may have deregistered the clock, or shut the pool down
        let Some(clock) = self.clocks.get_mut(&id) else { return };
        match clock.advance() {
            Some(next) if !clock.is_cancelled() && !self.stopping => self.timers.schedule(next, ManagerTimer::Clock(id)),
            _ => {
                self.clocks.remove(&id);
                self.pool.release_clock(id);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reading
    // ---------------------------------------------------------------------

    fn on_readable(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else { return };

        if !ch.wants_read() {
            // Errors are reported regardless of interest
            let pending = ch.stream().take_error();
            match pending {
                Ok(None) => {}
                Ok(Some(e)) | Err(e) => self.finish(id, ChannelState::Failed, StateReason::SocketError(e.kind())),
            }
            return;
        }

        let read = ch.read_once(self.read_chunk_size);
        match read {
            Ok(0) => {
                tracing::debug!(manager = self.index, channel = %id, "peer closed");
                self.finish(id, ChannelState::Closed, StateReason::PeerClosed);
            }
            Ok(n) => {
                tracing::trace!(channel = %id, bytes = n, "read");
                self.pool.counters().record_read(n);
                self.deliver(id);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!(manager = self.index, channel = %id, "read failed: {e}");
                self.finish(id, ChannelState::Failed, StateReason::SocketError(e.kind()));
            }
        }
    }

    /// Offer the read buffer to the handler and enforce the read high-water mark
    fn deliver(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else { return };
        if ch.shared().is_close_requested() {
            return;
        }

        if ch.buffered_read() > 0 {
            let consumed = self.handler.on_data(&self.pool, id, ch.read_buffer());
            ch.consume_read(consumed);
        }

        if ch.buffered_read() > self.read_high_water_mark && !ch.read_suspended() {
            ch.set_read_suspended(true);
            tracing::debug!(channel = %id, buffered = ch.buffered_read(), "read suspended");
            self.sync_interest(id);
            self.alert(id, ChannelAlert::ReadSuspended);
        }
    }

    // ---------------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------------

    fn flush(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else { return };
        if ch.state().is_terminal() {
            return;
        }

        match ch.flush() {
            Ok(written) => self.pool.counters().record_written(written),
            Err(e) => {
                tracing::debug!(manager = self.index, channel = %id, "write failed: {e}");
                self.finish(id, ChannelState::Failed, StateReason::SocketError(e.kind()));
                return;
            }
        }

        if ch.queue_is_empty() {
            if let Some(reason) = ch.pending_close() {
                self.finish(id, ChannelState::Closed, reason);
                return;
            }
        }

        self.sync_interest(id);
        self.check_low_water(id);
    }

    fn check_low_water(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else { return };
        if ch.take_low_water() {
            self.alert(id, ChannelAlert::LowWater);
        }
    }

    // ---------------------------------------------------------------------
    // Closing
    // ---------------------------------------------------------------------

    fn close(&mut self, id: ChannelId, graceful: bool, reason: StateReason) {
        let Some(ch) = self.channels.get_mut(&id) else { return };
        ch.shared().request_close();

        if !graceful || ch.queue_is_empty() {
            self.finish(id, ChannelState::Closed, reason);
            return;
        }

        // The caller asked for this close, so only the final transition is reported
        ch.set_pending_close(reason);
        if ch.state() == ChannelState::Connected {
            ch.set_state(ChannelState::Closing);
        }
        self.sync_interest(id);
    }

    /// Remove a channel and report its final state
    ///
    /// A close the channel did not ask for (peer hang-up) passes through
    /// Closing, so the handler sees Connected -> Closing -> Closed. After a
    /// requested close, and for failures, only the final transition is
    /// reported.
    fn finish(&mut self, id: ChannelId, state: ChannelState, reason: StateReason) {
        let Some(mut ch) = self.channels.remove(&id) else { return };
        let requested = ch.shared().is_close_requested();
        self.tokens.remove(&ch.token());
        if ch.registered().is_some() {
            if let Err(e) = self.mux.deregister_fd(ch.stream()) {
                tracing::trace!(channel = %id, "deregister: {e}");
            }
        }
        ch.shared().request_close();
        ch.discard_queue();
        self.pool.release_channel(id);

        let mut old = ch.set_state(state);
        if state == ChannelState::Closed && old == ChannelState::Connected && !requested {
            self.handler.on_channel_state(&self.pool, id, old, ChannelState::Closing, reason);
            old = ChannelState::Closing;
        }
        tracing::debug!(manager = self.index, channel = %id, state = %state, reason = ?reason, "channel down");
        self.handler.on_channel_state(&self.pool, id, old, state, reason);
        // Socket closes when `ch` drops, after the final callback
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn alert(&self, id: ChannelId, alert: ChannelAlert) {
        let Some(ch) = self.channels.get(&id) else { return };
        if ch.shared().is_close_requested() {
            return;
        }
        tracing::trace!(channel = %id, alert = ?alert, "alert");
        self.handler.on_channel_alert(&self.pool, id, alert);
    }

    fn sync_interest(&mut self, id: ChannelId) {
        if let Err(e) = self.try_sync_interest(id) {
            tracing::debug!(manager = self.index, channel = %id, "interest update failed: {e}");
            let kind = match &e {
                sluice_transport::Error::Io(io) => io.kind(),
                _ => io::ErrorKind::Other,
            };
            self.finish(id, ChannelState::Failed, StateReason::SocketError(kind));
        }
    }

    /// Bring the multiplexer registration in line with what the channel needs
    ///
    /// A channel that needs nothing is removed from the multiplexer entirely,
    /// since hang-ups are reported even with an empty interest set.
    fn try_sync_interest(&mut self, id: ChannelId) -> sluice_transport::Result<()> {
        let Some(ch) = self.channels.get_mut(&id) else { return Ok(()) };
        let desired = Some(ch.desired_interest()).filter(|i| *i != Interest::NONE);

        match (ch.registered(), desired) {
            (None, Some(interest)) => self.mux.register_fd(ch.stream(), ch.token(), interest)?,
            (Some(_), None) => self.mux.deregister_fd(ch.stream())?,
            (Some(old), Some(new)) if old != new => self.mux.modify_fd(ch.stream(), ch.token(), new)?,
            _ => {}
        }
        ch.set_registered(desired);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Shutdown and faults
    // ---------------------------------------------------------------------

    fn begin_shutdown(&mut self, grace: Duration) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        tracing::debug!(manager = self.index, channels = self.channels.len(), "draining for shutdown");

        let servers: Vec<_> = self.listeners.keys().copied().collect();
        for server in servers {
            self.remove_listener(server);
            self.pool.forget_server(server);
        }

        for (id, _) in self.clocks.drain() {
            self.pool.release_clock(id);
        }

        let ids: Vec<_> = self.channels.keys().copied().collect();
        for id in ids {
            self.close(id, true, StateReason::Shutdown);
        }

        if !self.channels.is_empty() {
            self.timers.schedule_after(grace, ManagerTimer::ForceClose);
        }
    }

    fn fire_timers(&mut self) {
        for timer in self.timers.drain_expired(Instant::now()) {
            match timer {
                ManagerTimer::Clock(id) => self.fire_clock(id),
                ManagerTimer::ForceClose => {
                    let ids: Vec<_> = self.channels.keys().copied().collect();
                    if !ids.is_empty() {
                        tracing::debug!(manager = self.index, channels = ids.len(), "force closing");
                    }
                    for id in ids {
                        self.finish(id, ChannelState::Closed, StateReason::Shutdown);
                    }
                }
            }
        }
    }

    /// The multiplexer failed: fail everything this manager owns and stop
    fn fault(&mut self, err: sluice_transport::Error) {
        tracing::error!(manager = self.index, "multiplexer failed: {err}");

        let ids: Vec<_> = self.channels.keys().copied().collect();
        for id in ids {
            self.finish(id, ChannelState::Failed, StateReason::ManagerFault);
        }

        let event = PoolEvent::ManagerFault { manager: self.index, error: err.to_string() };
        self.exit(Error::Transport(format!("event manager {} failed", self.index)));
        self.handler.on_pool_event(&self.pool, &event);
    }

    /// Leave the pool: stop receiving assignments, then settle queued commands
    fn exit(&mut self, reason: Error) {
        self.listeners.clear();
        self.clocks.clear();
        self.pool.counters().set_registrations(self.index, 0);
        self.pool.manager_exited(self.index);

        // Nothing new is routed here past manager_exited; anything already
        // queued still gets an answer
        while let Ok(cmd) = self.rx.try_recv() {
            if let Command::Adopt { channel, origin, .. } = cmd {
                self.pool.release_channel(channel);
                let err = match &reason {
                    Error::Shutdown => Error::Shutdown,
                    other => Error::Transport(other.to_string()),
                };
                self.pool.reject(origin, err);
            }
        }
    }
}
