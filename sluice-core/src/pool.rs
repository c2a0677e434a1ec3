//! Channel pool: the public face of the engine
//!
//! A [`ChannelPool`] owns `thread_count` event managers and one connector
//! thread. It keeps the cross-thread directory (which manager owns which
//! channel, which listeners exist, which connect requests are pending) behind
//! a single mutex that is never held across callbacks.
//!
//! # Example
//!
//! ```no_run
//! use sluice_core::{ChannelPool, PoolConfig};
//!
//! # fn main() -> sluice_core::Result<()> {
//! let pool = ChannelPool::new(PoolConfig::default(), ())?;
//! let server = pool.listen_default("127.0.0.1:0".parse().unwrap(), |pool, _, channel, peer| {
//!     println!("accepted {channel} from {peer}");
//!     let _ = pool.send(channel, b"hello".to_vec());
//! })?;
//! println!("listening on {}", pool.server_address(server)?);
//! pool.shutdown()?;
//! # Ok(())
//! # }
//! ```

use crate::balancer::Balancer;
use crate::channel::{ChannelId, ChannelShared, ChannelStats, SendStatus};
use crate::clock::{Clock, ClockId};
use crate::config::{ConnectOptions, PoolConfig};
use crate::connector::{ConnectRequest, Connector, ConnectorCommand, RequestId};
use crate::event_manager::{Command, EventManager, Origin};
use crate::handler::{ChannelHandler, PoolEvent};
use crate::listener::{Listener, ServerEntry, ServerId};
use crate::timer::deadline_after;
use crate::{Error, Result};
use crossbeam_channel::Sender;
use mio::net::TcpStream;
use sluice_transport::{tcp, Multiplexer, Waker};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Multiplexer id reserved for a loop's waker
pub(crate) const WAKER_TOKEN: usize = usize::MAX;

/// Command queue of a pool thread plus the waker that interrupts its wait
pub(crate) struct Mailbox<C> {
    tx: Sender<C>,
    waker: Arc<Waker>,
}

impl<C> Mailbox<C> {
    pub(crate) fn new(tx: Sender<C>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Queue `cmd` and wake the owner; hands the command back if the owner is gone
    pub(crate) fn send(&self, cmd: C) -> std::result::Result<(), C> {
        self.tx.send(cmd).map_err(|e| e.into_inner())?;
        if let Err(e) = self.waker.wake() {
            tracing::warn!("failed to wake pool thread: {e}");
        }
        Ok(())
    }
}

/// Directory record of an open channel
#[derive(Debug, Clone)]
struct ChannelEntry {
    owner: usize,
    shared: Arc<ChannelShared>,
    peer: SocketAddr,
    local: SocketAddr,
}

/// Directory record of a registered clock
#[derive(Debug, Clone)]
struct ClockEntry {
    owner: usize,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug)]
struct PoolState {
    channels: HashMap<ChannelId, ChannelEntry>,
    balancer: Balancer,
    servers: HashMap<ServerId, ServerEntry>,
    clocks: HashMap<ClockId, ClockEntry>,
    pending: HashSet<RequestId>,
    next_channel_id: u64,
    next_server_id: u64,
    next_clock_id: u64,
    next_request_id: u64,
    shutting_down: bool,
}

/// Byte totals over every channel the pool has served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolTotals {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Bytes accepted by `send` (queued or over the high-water mark)
    pub bytes_requested: u64,
}

/// Pool-wide counters, updated by the managers and by `send`
#[derive(Debug)]
pub(crate) struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    bytes_requested: AtomicU64,
    /// Multiplexer registrations per manager, waker excluded
    registrations: Vec<AtomicUsize>,
}

impl Counters {
    fn new(managers: usize) -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_requested: AtomicU64::new(0),
            registrations: (0..managers).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_requested(&self, n: usize) {
        self.bytes_requested.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_registrations(&self, manager: usize, count: usize) {
        if let Some(slot) = self.registrations.get(manager) {
            slot.store(count, Ordering::Relaxed);
        }
    }

    fn totals(&self) -> PoolTotals {
        PoolTotals {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_requested: self.bytes_requested.load(Ordering::Relaxed),
        }
    }

    fn take_totals(&self) -> PoolTotals {
        PoolTotals {
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
            bytes_written: self.bytes_written.swap(0, Ordering::Relaxed),
            bytes_requested: self.bytes_requested.swap(0, Ordering::Relaxed),
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    handler: Arc<dyn ChannelHandler>,
    managers: Vec<Mailbox<Command>>,
    connector: Mailbox<ConnectorCommand>,
    state: Mutex<PoolState>,
    counters: Counters,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

/// Handle to a running channel pool
///
/// Cheap to clone; every clone refers to the same pool. Threads keep running
/// until [`ChannelPool::shutdown`] is called.
#[derive(Clone)]
pub struct ChannelPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPool")
            .field("threads", &self.shared.managers.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl ChannelPool {
    /// Validate `config`, then start the event managers and the connector
    pub fn new<H: ChannelHandler>(config: PoolConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let mux_type = config.multiplexer_type()?;

        let mut managers = Vec::with_capacity(config.thread_count);
        let mut loops = Vec::with_capacity(config.thread_count);
        for index in 0..config.thread_count {
            let mut mux = Multiplexer::new(mux_type)?;
            let waker = Arc::new(Waker::new()?);
            waker.register(&mut mux, WAKER_TOKEN)?;
            let (tx, rx) = crossbeam_channel::unbounded();
            managers.push(Mailbox::new(tx, waker.clone()));
            loops.push((index, mux, waker, rx));
        }

        let mut connector_mux = Multiplexer::new(mux_type)?;
        let connector_waker = Arc::new(Waker::new()?);
        connector_waker.register(&mut connector_mux, WAKER_TOKEN)?;
        let (connector_tx, connector_rx) = crossbeam_channel::unbounded();

        let pool = ChannelPool {
            shared: Arc::new(PoolShared {
                handler: Arc::new(handler),
                managers,
                connector: Mailbox::new(connector_tx, connector_waker.clone()),
                state: Mutex::new(PoolState {
                    channels: HashMap::new(),
                    balancer: Balancer::new(config.thread_count),
                    servers: HashMap::new(),
                    clocks: HashMap::new(),
                    pending: HashSet::new(),
                    next_channel_id: 1,
                    next_server_id: 1,
                    next_clock_id: 1,
                    next_request_id: 1,
                    shutting_down: false,
                }),
                counters: Counters::new(config.thread_count),
                threads: Mutex::new(Vec::new()),
                shutdown_started: AtomicBool::new(false),
                config,
            }),
        };

        for (index, mux, waker, rx) in loops {
            let manager = EventManager::new(index, mux, waker, rx, pool.clone());
            let spawned = thread::Builder::new()
                .name(format!("sluice-mgr-{index}"))
                .spawn(move || manager.run());
            pool.track_thread(spawned)?;
        }

        let connector = Connector::new(connector_mux, connector_waker, connector_rx, pool.clone());
        let spawned = thread::Builder::new()
            .name("sluice-connector".to_string())
            .spawn(move || connector.run());
        pool.track_thread(spawned)?;

        tracing::debug!(
            threads = pool.shared.config.thread_count,
            multiplexer = %mux_type,
            "channel pool started"
        );
        Ok(pool)
    }

    fn track_thread(&self, spawned: io::Result<JoinHandle<()>>) -> Result<()> {
        match spawned {
            Ok(handle) => {
                self.threads().push(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!("failed to spawn pool thread: {e}");
                let _ = self.shutdown();
                Err(Error::Io(e))
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.shared.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.shared.handler
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.shared.counters
    }

    // ---------------------------------------------------------------------
    // Listeners
    // ---------------------------------------------------------------------

    /// Bind `address` and accept connections on it
    ///
    /// Binding happens before this returns, so a port of 0 is resolved by the
    /// time [`ChannelPool::server_address`] is called. `on_accept` runs on the
    /// accepted channel's manager thread after the channel is registered.
    pub fn listen<F>(&self, address: SocketAddr, backlog: u32, on_accept: F) -> Result<ServerId>
    where
        F: Fn(&ChannelPool, ServerId, ChannelId, SocketAddr) + Send + Sync + 'static,
    {
        if backlog == 0 {
            return Err(Error::Config("listen backlog must be at least 1".to_string()));
        }
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }

        let socket = tcp::bind_listener(&address, backlog)
            .map_err(|e| Error::Bind { address, source: into_io_error(e) })?;
        let bound = socket.local_addr()?;

        let mut state = self.state();
        if state.shutting_down {
            return Err(Error::Shutdown);
        }
        let owner = state.balancer.next_round_robin().ok_or(Error::Shutdown)?;
        let id = ServerId(state.next_server_id);
        state.next_server_id += 1;

        let listener = Listener::new(id, socket, bound, Arc::new(on_accept));
        if self.shared.managers[owner].send(Command::Listen { listener }).is_err() {
            return Err(Error::Shutdown);
        }
        state.servers.insert(id, ServerEntry { address: bound, owner });
        drop(state);

        tracing::debug!(server = %id, address = %bound, backlog, manager = owner, "listening");
        Ok(id)
    }

    /// `listen` with the configured backlog
    pub fn listen_default<F>(&self, address: SocketAddr, on_accept: F) -> Result<ServerId>
    where
        F: Fn(&ChannelPool, ServerId, ChannelId, SocketAddr) + Send + Sync + 'static,
    {
        self.listen(address, self.shared.config.listen_backlog, on_accept)
    }

    /// Bound local address of a listener
    pub fn server_address(&self, server: ServerId) -> Result<SocketAddr> {
        self.state()
            .servers
            .get(&server)
            .map(|entry| entry.address)
            .ok_or(Error::ServerNotFound(server))
    }

    /// Stop accepting on `server` and close its socket
    ///
    /// Channels already accepted through it are unaffected.
    pub fn stop_listen(&self, server: ServerId) -> Result<()> {
        let entry = self.state().servers.remove(&server).ok_or(Error::ServerNotFound(server))?;
        let _ = self.shared.managers[entry.owner].send(Command::StopListen(server));
        tracing::debug!(server = %server, address = %entry.address, "listener stopped");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Outbound connections
    // ---------------------------------------------------------------------

    /// Connect to the first reachable address of `addresses`
    ///
    /// Addresses are tried in order; a full pass is one attempt, and up to
    /// `options.max_attempts` passes are made with `options.retry_interval`
    /// between them. `on_result` is called exactly once: on success from the
    /// new channel's manager thread, on failure from the connector thread.
    pub fn connect<F>(&self, addresses: &[SocketAddr], options: ConnectOptions, on_result: F) -> Result<RequestId>
    where
        F: FnOnce(&ChannelPool, RequestId, Result<ChannelId>) + Send + 'static,
    {
        let mut state = self.state();
        if state.shutting_down {
            return Err(Error::Shutdown);
        }

        let id = RequestId(state.next_request_id);
        let request = ConnectRequest::new(id, addresses.to_vec(), options)?;
        state.next_request_id += 1;

        let cmd = ConnectorCommand::Connect { request, on_result: Box::new(on_result) };
        if self.shared.connector.send(cmd).is_err() {
            return Err(Error::Shutdown);
        }
        state.pending.insert(id);
        drop(state);

        tracing::debug!(request = %id, addresses = ?addresses, "connect requested");
        Ok(id)
    }

    /// Resolve `host` and connect to its addresses in resolution order
    ///
    /// Name resolution blocks the calling thread; a name that does not
    /// resolve fails with [`Error::Resolve`] before any request is created.
    /// Everything after resolution behaves like [`ChannelPool::connect`].
    pub fn connect_host<F>(&self, host: &str, port: u16, options: ConnectOptions, on_result: F) -> Result<RequestId>
    where
        F: FnOnce(&ChannelPool, RequestId, Result<ChannelId>) + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let resolve_error = |source| Error::Resolve { host: host.to_string(), source };
        let addresses: Vec<SocketAddr> = (host, port).to_socket_addrs().map_err(resolve_error)?.collect();
        if addresses.is_empty() {
            return Err(resolve_error(io::Error::new(io::ErrorKind::NotFound, "no addresses")));
        }
        tracing::debug!(host, port, resolved = addresses.len(), "host resolved");
        self.connect(&addresses, options, on_result)
    }

    /// Adopt an already connected socket as a channel
    pub fn import(&self, stream: std::net::TcpStream) -> Result<ChannelId> {
        stream.set_nonblocking(true)?;
        self.try_place(TcpStream::from_std(stream), Origin::Imported).map_err(|(err, _)| err)
    }

    // ---------------------------------------------------------------------
    // Channel operations
    // ---------------------------------------------------------------------

    fn lookup(&self, channel: ChannelId) -> Result<ChannelEntry> {
        self.state().channels.get(&channel).cloned().ok_or(Error::ChannelNotFound(channel))
    }

    /// Like `lookup`, but channels being closed count as gone
    fn lookup_open(&self, channel: ChannelId) -> Result<ChannelEntry> {
        let entry = self.lookup(channel)?;
        if entry.shared.is_close_requested() {
            return Err(Error::ChannelNotFound(channel));
        }
        Ok(entry)
    }

    /// Queue `data` for writing on `channel`
    ///
    /// Returns the backpressure status; see [`SendStatus`]. Writes on one
    /// channel from one thread are delivered in call order.
    pub fn send(&self, channel: ChannelId, data: impl Into<Vec<u8>>) -> Result<SendStatus> {
        let data = data.into();
        let len = data.len();
        let entry = self.lookup_open(channel)?;

        let status = entry.shared.reserve(len);
        let cmd = match status {
            SendStatus::Rejected => Command::Backpressure(channel),
            _ => Command::Write {
                channel,
                data,
                high_water: status == SendStatus::HighWater,
            },
        };

        if self.shared.managers[entry.owner].send(cmd).is_err() {
            if status != SendStatus::Rejected {
                entry.shared.release(len);
            }
            return Err(Error::ChannelNotFound(channel));
        }
        if status != SendStatus::Rejected {
            self.shared.counters.record_requested(len);
        }
        Ok(status)
    }

    /// Close `channel`
    ///
    /// A graceful close writes out the queue first; otherwise queued data is
    /// discarded. No data or alert callbacks are delivered for the channel
    /// once this returns, only its final Closed or Failed transition.
    pub fn close(&self, channel: ChannelId, graceful: bool) -> Result<()> {
        let entry = self.lookup(channel)?;
        entry.shared.request_close();
        let _ = self.shared.managers[entry.owner].send(Command::Close { channel, graceful });
        Ok(())
    }

    /// Resume reading (and re-offer buffered inbound data)
    pub fn enable_read(&self, channel: ChannelId) -> Result<()> {
        let entry = self.lookup_open(channel)?;
        self.shared.managers[entry.owner]
            .send(Command::EnableRead(channel))
            .map_err(|_| Error::ChannelNotFound(channel))
    }

    /// Stop reading from the socket until `enable_read`
    pub fn disable_read(&self, channel: ChannelId) -> Result<()> {
        let entry = self.lookup_open(channel)?;
        self.shared.managers[entry.owner]
            .send(Command::DisableRead(channel))
            .map_err(|_| Error::ChannelNotFound(channel))
    }

    /// Replace the write watermarks of one channel
    pub fn set_write_watermarks(&self, channel: ChannelId, low: usize, high: usize) -> Result<()> {
        if low > high {
            return Err(Error::Config(format!("low-water mark {low} exceeds high-water mark {high}")));
        }
        let entry = self.lookup_open(channel)?;
        entry.shared.set_watermarks(low, high);
        let _ = self.shared.managers[entry.owner].send(Command::Recheck(channel));
        Ok(())
    }

    pub fn channel_stats(&self, channel: ChannelId) -> Result<ChannelStats> {
        Ok(self.lookup(channel)?.shared.stats())
    }

    /// Restart the queued-bytes high mark from the current queue size
    pub fn reset_max_queued(&self, channel: ChannelId) -> Result<()> {
        self.lookup(channel)?.shared.reset_max_queued();
        Ok(())
    }

    pub fn peer_address(&self, channel: ChannelId) -> Result<SocketAddr> {
        Ok(self.lookup(channel)?.peer)
    }

    pub fn local_address(&self, channel: ChannelId) -> Result<SocketAddr> {
        Ok(self.lookup(channel)?.local)
    }

    /// Index of the event manager that owns `channel`
    pub fn channel_owner(&self, channel: ChannelId) -> Result<usize> {
        Ok(self.lookup(channel)?.owner)
    }

    // ---------------------------------------------------------------------
    // Clocks
    // ---------------------------------------------------------------------

    /// Run `callback` on a pool thread after `delay`, then every `period`
    ///
    /// Without a period the clock fires once. Clocks are spread round-robin
    /// over the event managers; the callback always runs on the same one.
    pub fn register_clock<F>(&self, delay: Duration, period: Option<Duration>, callback: F) -> Result<ClockId>
    where
        F: FnMut(&ChannelPool, ClockId) + Send + 'static,
    {
        let mut state = self.state();
        if state.shutting_down {
            return Err(Error::Shutdown);
        }
        let owner = state.balancer.next_round_robin().ok_or(Error::Shutdown)?;
        self.add_clock(state, owner, delay, period, Box::new(callback))
    }

    /// Like [`ChannelPool::register_clock`], but the callback runs on the
    /// thread that owns `channel`, never concurrently with its callbacks
    pub fn register_clock_on<F>(
        &self,
        channel: ChannelId,
        delay: Duration,
        period: Option<Duration>,
        callback: F,
    ) -> Result<ClockId>
    where
        F: FnMut(&ChannelPool, ClockId) + Send + 'static,
    {
        let state = self.state();
        if state.shutting_down {
            return Err(Error::Shutdown);
        }
        let owner = state
            .channels
            .get(&channel)
            .filter(|entry| !entry.shared.is_close_requested())
            .map(|entry| entry.owner)
            .ok_or(Error::ChannelNotFound(channel))?;
        self.add_clock(state, owner, delay, period, Box::new(callback))
    }

    fn add_clock(
        &self,
        mut state: MutexGuard<'_, PoolState>,
        owner: usize,
        delay: Duration,
        period: Option<Duration>,
        callback: crate::handler::ClockCallback,
    ) -> Result<ClockId> {
        if period.is_some_and(|p| p.is_zero()) {
            return Err(Error::Config("clock period must be positive".to_string()));
        }
        let id = ClockId(state.next_clock_id);
        state.next_clock_id += 1;

        let cancelled = Arc::new(AtomicBool::new(false));
        let due = deadline_after(Instant::now(), delay);
        let clock = Clock::new(id, due, period, callback, cancelled.clone());
        if self.shared.managers[owner].send(Command::AddClock(clock)).is_err() {
            return Err(Error::Shutdown);
        }
        state.clocks.insert(id, ClockEntry { owner, cancelled });
        drop(state);

        tracing::debug!(clock = %id, manager = owner, ?delay, ?period, "clock registered");
        Ok(id)
    }

    /// Stop a clock
    ///
    /// Once this returns the callback is not started again, though a call
    /// already running on the clock's thread finishes normally.
    pub fn deregister_clock(&self, clock: ClockId) -> Result<()> {
        let entry = self.state().clocks.remove(&clock).ok_or(Error::ClockNotFound(clock))?;
        entry.cancelled.store(true, Ordering::Release);
        let _ = self.shared.managers[entry.owner].send(Command::RemoveClock(clock));
        tracing::debug!(clock = %clock, "clock deregistered");
        Ok(())
    }

    /// Clocks registered and not yet finished
    pub fn num_clocks(&self) -> usize {
        self.state().clocks.len()
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn num_channels(&self) -> usize {
        self.state().channels.len()
    }

    pub fn num_threads(&self) -> usize {
        self.shared.managers.len()
    }

    /// Open channels per event manager
    pub fn manager_loads(&self) -> Vec<usize> {
        self.state().balancer.loads().to_vec()
    }

    /// Byte totals since start or since the last [`ChannelPool::reset_totals`]
    pub fn totals(&self) -> PoolTotals {
        self.shared.counters.totals()
    }

    /// Return the byte totals and restart them from zero
    pub fn reset_totals(&self) -> PoolTotals {
        self.shared.counters.take_totals()
    }

    /// Sockets (channels and listeners) event manager `manager` is watching
    /// as of its last loop iteration; `None` for an out-of-range index
    pub fn num_events(&self, manager: usize) -> Option<usize> {
        self.shared.counters.registrations.get(manager).map(|n| n.load(Ordering::Relaxed))
    }

    /// Connect requests that have not reported a result yet
    pub fn pending_connects(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown_started.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    /// Stop the pool
    ///
    /// New listens and connects fail with [`Error::Shutdown`], pending connect
    /// requests are cancelled with the same error, channels close gracefully
    /// and whatever is still open after `shutdown_grace` is closed forcibly.
    /// Returns once every pool thread has exited, except the calling thread
    /// when called from a callback. Only the first call does the work.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.shutdown_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("channel pool shutting down");

        self.state().shutting_down = true;

        let _ = self.shared.connector.send(ConnectorCommand::Shutdown);
        let grace = self.shared.config.shutdown_grace;
        for manager in &self.shared.managers {
            let _ = manager.send(Command::Shutdown { grace });
        }

        let handles = std::mem::take(&mut *self.threads());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("pool thread").to_string();
            if handle.join().is_err() {
                tracing::warn!("{name} panicked");
            }
        }

        tracing::debug!("channel pool stopped");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Pool thread hooks
    // ---------------------------------------------------------------------

    /// Register a new channel and hand its socket to the least-loaded manager
    ///
    /// Failures are reported through `origin`: the connect callback for
    /// outbound channels, a pool event or a log line for accepted ones.
    pub(crate) fn place_channel(&self, stream: TcpStream, origin: Origin) {
        if let Err((err, Some(origin))) = self.try_place(stream, origin) {
            self.reject(origin, err);
        }
    }

    fn try_place(
        &self,
        stream: TcpStream,
        origin: Origin,
    ) -> std::result::Result<ChannelId, (Error, Option<Origin>)> {
        let addrs = stream.peer_addr().and_then(|peer| Ok((peer, stream.local_addr()?)));
        let (peer, local) = match addrs {
            Ok(pair) => pair,
            Err(e) => return Err((Error::Io(e), Some(origin))),
        };

        let mut state = self.state();
        if state.shutting_down {
            return Err((Error::Shutdown, Some(origin)));
        }
        if self.shared.config.max_channels.is_some_and(|max| state.channels.len() >= max) {
            return Err((Error::ChannelLimit, Some(origin)));
        }
        let Some(owner) = state.balancer.least_loaded() else {
            return Err((Error::Shutdown, Some(origin)));
        };

        let id = ChannelId(state.next_channel_id);
        state.next_channel_id += 1;

        let config = &self.shared.config;
        let shared = Arc::new(ChannelShared::new(config.write_low_water_mark, config.write_high_water_mark));
        let cmd = Command::Adopt { channel: id, stream, shared: shared.clone(), origin };
        if let Err(cmd) = self.shared.managers[owner].send(cmd) {
            return Err((Error::Shutdown, cmd.into_origin()));
        }
        state.channels.insert(id, ChannelEntry { owner, shared, peer, local });
        state.balancer.add(owner);
        drop(state);

        tracing::debug!(channel = %id, %peer, manager = owner, "channel placed");
        Ok(id)
    }

    /// Tell whoever waits for a channel that it could not be created
    pub(crate) fn reject(&self, origin: Origin, err: Error) {
        match origin {
            Origin::Accepted { server, peer, .. } => {
                tracing::warn!(server = %server, %peer, "dropping accepted connection: {err}");
                if matches!(err, Error::ChannelLimit) {
                    self.handler().on_pool_event(self, &PoolEvent::ChannelLimit { server_id: server, peer });
                }
            }
            Origin::Connected { request, on_result } => {
                tracing::debug!(request = %request, "connected socket not adopted: {err}");
                on_result(self, request, Err(err));
            }
            Origin::Imported => {
                tracing::debug!("imported socket not adopted: {err}");
            }
        }
    }

    /// Remove a closed channel from the directory
    pub(crate) fn release_channel(&self, channel: ChannelId) {
        let mut state = self.state();
        if let Some(entry) = state.channels.remove(&channel) {
            state.balancer.remove(entry.owner);
        }
    }

    /// Remove a listener the owning manager could not keep
    pub(crate) fn forget_server(&self, server: ServerId) {
        self.state().servers.remove(&server);
    }

    /// Drop a clock that fired for the last time or was refused by its manager
    pub(crate) fn release_clock(&self, clock: ClockId) {
        self.state().clocks.remove(&clock);
    }

    /// A connect request reached its terminal state
    pub(crate) fn finish_request(&self, request: RequestId) {
        self.state().pending.remove(&request);
    }

    /// Take a stopped manager out of rotation and drop its listeners
    pub(crate) fn manager_exited(&self, index: usize) {
        let mut state = self.state();
        state.balancer.mark_dead(index);
        state.servers.retain(|_, entry| entry.owner != index);
        state.channels.retain(|_, entry| entry.owner != index);
        state.clocks.retain(|_, entry| entry.owner != index);
    }
}

fn into_io_error(err: sluice_transport::Error) -> io::Error {
    match err {
        sluice_transport::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
    }
}
