//! Channels: one TCP byte stream managed by the pool
//!
//! A [`Channel`] is owned by exactly one event manager and only touched on
//! that manager's thread. The parts other threads need (queued byte count,
//! watermarks, statistics, the close-requested flag) live in
//! [`ChannelShared`], which the pool's directory also holds.

use crate::write_queue::WriteQueue;
use mio::net::TcpStream;
use sluice_transport::Interest;
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool-unique channel identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl ChannelState {
    /// Closed and Failed are final
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a state transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateReason {
    /// Outbound connect completed
    Established,
    /// Accepted by a listener
    Accepted,
    /// Adopted through `ChannelPool::import`
    Imported,
    /// The peer closed its end
    PeerClosed,
    /// `close()` was called
    LocalClose,
    /// A read or write failed
    SocketError(io::ErrorKind),
    /// The owning event manager failed
    ManagerFault,
    /// The pool is shutting down
    Shutdown,
}

/// Flow-control notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAlert {
    /// Queued outbound bytes went above the write high-water mark
    HighWater,
    /// Queued outbound bytes drained to the write low-water mark
    LowWater,
    /// Unconsumed inbound bytes exceeded the read high-water mark; reading stopped
    ReadSuspended,
    /// Reading was resumed by `enable_read`
    ReadEnabled,
    /// Reading was paused by `disable_read`
    ReadDisabled,
}

/// Result of `ChannelPool::send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Buffer queued, below the high-water mark
    Queued,
    /// Buffer queued, but the queue is now above the high-water mark
    HighWater,
    /// The queue went above the high-water mark and has not yet drained to
    /// the low-water mark; buffer dropped
    Rejected,
}

impl SendStatus {
    /// Whether the caller should wait for a low-water alert
    pub fn is_backpressure(self) -> bool {
        !matches!(self, SendStatus::Queued)
    }
}

/// Per-channel byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub queued_bytes: usize,
    pub max_queued_bytes: usize,
}

/// Channel state visible from every thread
#[derive(Debug)]
pub struct ChannelShared {
    queued: AtomicUsize,
    max_queued: AtomicUsize,
    high_water: AtomicUsize,
    low_water: AtomicUsize,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    close_requested: AtomicBool,
    /// Set when a send crosses the high-water mark, cleared by the LowWater alert
    blocked: AtomicBool,
}

impl ChannelShared {
    pub fn new(low_water: usize, high_water: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            max_queued: AtomicUsize::new(0),
            high_water: AtomicUsize::new(high_water),
            low_water: AtomicUsize::new(low_water),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            close_requested: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
        }
    }

    /// Account `len` outbound bytes and classify the send
    ///
    /// `Rejected` leaves the counter untouched; the other results include
    /// `len` in the queued total. Once a send crosses the high-water mark,
    /// every send is rejected until the owner clears the flag with the
    /// LowWater alert, even if the queue already shrank below the high mark.
    pub fn reserve(&self, len: usize) -> SendStatus {
        if self.blocked.load(Ordering::Acquire) {
            return SendStatus::Rejected;
        }
        let high = self.high_water.load(Ordering::Acquire);
        let mut current = self.queued.load(Ordering::Acquire);

        let total = loop {
            if current > high {
                self.blocked.store(true, Ordering::Release);
                return SendStatus::Rejected;
            }
            let total = current.saturating_add(len);
            match self.queued.compare_exchange_weak(
                current,
                total,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break total,
                Err(actual) => current = actual,
            }
        };

        self.max_queued.fetch_max(total, Ordering::AcqRel);
        if total > high {
            self.blocked.store(true, Ordering::Release);
            SendStatus::HighWater
        } else {
            SendStatus::Queued
        }
    }

    /// Remove `n` bytes from the queued total (written or discarded)
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        // Never underflows: every release matches an earlier reserve
        let _ = self.queued.fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
            Some(q.saturating_sub(n))
        });
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn low_water(&self) -> usize {
        self.low_water.load(Ordering::Acquire)
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    pub fn set_watermarks(&self, low: usize, high: usize) {
        self.low_water.store(low, Ordering::Release);
        self.high_water.store(high, Ordering::Release);
    }

    pub fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Whether sends are refused until the next LowWater alert
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    fn unblock(&self) {
        self.blocked.store(false, Ordering::Release);
    }

    pub fn reset_max_queued(&self) {
        self.max_queued.store(self.queued(), Ordering::Release);
    }

    /// Set the close-requested flag, returning its previous value
    pub fn request_close(&self) -> bool {
        self.close_requested.swap(true, Ordering::AcqRel)
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            queued_bytes: self.queued(),
            max_queued_bytes: self.max_queued.load(Ordering::Acquire),
        }
    }
}

/// A channel as held by its owning event manager
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    /// Multiplexer id inside the owning manager
    token: usize,
    stream: TcpStream,
    state: ChannelState,
    peer: SocketAddr,
    local: SocketAddr,
    shared: Arc<ChannelShared>,
    read_buf: Vec<u8>,
    queue: WriteQueue,
    /// Paused by `disable_read`
    read_enabled: bool,
    /// Paused because the read buffer is above the read high-water mark
    read_suspended: bool,
    /// A HighWater alert fired and its LowWater alert is still owed
    low_water_armed: bool,
    /// Interest currently registered with the multiplexer (None = not registered)
    registered: Option<Interest>,
    /// Graceful close in progress; the channel closes once the queue drains
    pending_close: Option<StateReason>,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        token: usize,
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        shared: Arc<ChannelShared>,
    ) -> Self {
        Self {
            id,
            token,
            stream,
            state: ChannelState::Connecting,
            peer,
            local,
            shared,
            read_buf: Vec::new(),
            queue: WriteQueue::new(),
            read_enabled: true,
            read_suspended: false,
            low_water_armed: false,
            registered: None,
            pending_close: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Update the state, returning the previous one
    pub fn set_state(&mut self, state: ChannelState) -> ChannelState {
        std::mem::replace(&mut self.state, state)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub fn registered(&self) -> Option<Interest> {
        self.registered
    }

    pub fn set_registered(&mut self, interest: Option<Interest>) {
        self.registered = interest;
    }

    pub fn pending_close(&self) -> Option<StateReason> {
        self.pending_close
    }

    pub fn set_pending_close(&mut self, reason: StateReason) {
        self.pending_close.get_or_insert(reason);
    }

    /// Interest this channel needs right now
    pub fn desired_interest(&self) -> Interest {
        Interest::new(self.wants_read(), !self.queue.is_empty())
    }

    /// Whether the manager should read from the socket
    pub fn wants_read(&self) -> bool {
        self.state == ChannelState::Connected
            && self.read_enabled
            && !self.read_suspended
            && !self.shared.is_close_requested()
    }

    pub fn read_enabled(&self) -> bool {
        self.read_enabled
    }

    pub fn set_read_enabled(&mut self, enabled: bool) {
        self.read_enabled = enabled;
    }

    pub fn read_suspended(&self) -> bool {
        self.read_suspended
    }

    pub fn set_read_suspended(&mut self, suspended: bool) {
        self.read_suspended = suspended;
    }

    /// One read of at most `max` bytes appended to the read buffer
    ///
    /// `Ok(0)` means the peer closed its end.
    pub fn read_once(&mut self, max: usize) -> io::Result<usize> {
        let start = self.read_buf.len();
        self.read_buf.resize(start + max, 0);

        let result = loop {
            match self.stream.read(&mut self.read_buf[start..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        let n = *result.as_ref().unwrap_or(&0);
        self.read_buf.truncate(start + n);
        if n > 0 {
            self.shared.record_read(n);
        }
        result
    }

    pub fn read_buffer(&self) -> &[u8] {
        &self.read_buf
    }

    /// Drop the first `n` buffered inbound bytes
    pub fn consume_read(&mut self, n: usize) {
        let n = n.min(self.read_buf.len());
        self.read_buf.drain(..n);
    }

    pub fn buffered_read(&self) -> usize {
        self.read_buf.len()
    }

    pub fn enqueue(&mut self, data: Vec<u8>) {
        self.queue.push(data);
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Write queued bytes until the socket stops accepting them
    pub fn flush(&mut self) -> io::Result<usize> {
        let result = self.queue.write_to(&mut self.stream);
        if let Ok(n) = result {
            self.shared.release(n);
            self.shared.record_written(n);
        }
        result
    }

    /// Drop every queued buffer
    pub fn discard_queue(&mut self) {
        let dropped = self.queue.clear();
        self.shared.release(dropped);
    }

    /// Arm the low-water alert; true when this arms it (HighWater should fire)
    pub fn arm_low_water(&mut self) -> bool {
        !std::mem::replace(&mut self.low_water_armed, true)
    }

    /// Disarm and report whether a LowWater alert is due; sends are
    /// accepted again from here on
    pub fn take_low_water(&mut self) -> bool {
        if self.low_water_armed && self.shared.queued() <= self.shared.low_water() {
            self.low_water_armed = false;
            self.shared.unblock();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_classification() {
        let shared = ChannelShared::new(4, 10);

        assert_eq!(shared.reserve(6), SendStatus::Queued);
        assert_eq!(shared.reserve(4), SendStatus::Queued);
        // 10 is at the mark, not above it
        assert_eq!(shared.queued(), 10);

        assert_eq!(shared.reserve(1), SendStatus::HighWater);
        assert_eq!(shared.queued(), 11);

        // Already above: nothing is added
        assert_eq!(shared.reserve(100), SendStatus::Rejected);
        assert_eq!(shared.queued(), 11);
        assert!(SendStatus::Rejected.is_backpressure());
        assert!(!SendStatus::Queued.is_backpressure());
    }

    #[test]
    fn test_release_and_stats() {
        let shared = ChannelShared::new(0, 100);
        shared.reserve(60);
        shared.release(50);
        shared.record_written(50);
        shared.record_read(7);

        let stats = shared.stats();
        assert_eq!(stats.queued_bytes, 10);
        assert_eq!(stats.max_queued_bytes, 60);
        assert_eq!(stats.bytes_written, 50);
        assert_eq!(stats.bytes_read, 7);

        shared.reset_max_queued();
        assert_eq!(shared.stats().max_queued_bytes, 10);

        shared.release(1000);
        assert_eq!(shared.queued(), 0);
    }

    #[test]
    fn test_rejects_between_marks_until_unblocked() {
        let shared = ChannelShared::new(4, 10);
        assert_eq!(shared.reserve(11), SendStatus::HighWater);
        assert!(shared.is_blocked());

        // Drained to 8: below high, still above low
        shared.release(3);
        assert_eq!(shared.queued(), 8);
        assert_eq!(shared.reserve(1), SendStatus::Rejected);
        assert_eq!(shared.queued(), 8);

        shared.release(4);
        shared.unblock();
        assert_eq!(shared.reserve(1), SendStatus::Queued);
    }

    #[test]
    fn test_watermark_change_applies_to_next_send() {
        let shared = ChannelShared::new(2, 4);
        assert_eq!(shared.reserve(3), SendStatus::Queued);
        shared.set_watermarks(8, 16);
        assert_eq!(shared.reserve(5), SendStatus::Queued);
        assert_eq!(shared.reserve(9), SendStatus::HighWater);
        assert_eq!((shared.low_water(), shared.high_water()), (8, 16));
    }

    #[test]
    fn test_request_close_reports_previous() {
        let shared = ChannelShared::new(0, 1);
        assert!(!shared.request_close());
        assert!(shared.request_close());
        assert!(shared.is_close_requested());
    }

    #[test]
    fn test_display() {
        assert_eq!(ChannelId(7).to_string(), "7");
        assert_eq!(ChannelState::Closing.to_string(), "closing");
        assert!(ChannelState::Failed.is_terminal());
        assert!(!ChannelState::Connected.is_terminal());
    }
}
