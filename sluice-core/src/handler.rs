//! Callback interfaces
//!
//! A [`ChannelHandler`] receives every channel-level notification of a pool.
//! All methods run on pool threads: channel callbacks on the owning event
//! manager's thread, connect failures on the connector thread. Callbacks may
//! call back into the pool; they must not block for long since they stall
//! every other channel of that thread.

use crate::channel::{ChannelAlert, ChannelId, ChannelState, StateReason};
use crate::clock::ClockId;
use crate::connector::RequestId;
use crate::listener::ServerId;
use crate::pool::ChannelPool;
use crate::Result;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Pool-level notifications not tied to a live channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// An event manager's multiplexer failed; its channels were failed and
    /// the manager stopped
    ManagerFault { manager: usize, error: String },
    /// One address of a connect request failed
    ConnectAttemptFailed {
        request_id: RequestId,
        address: SocketAddr,
        /// Pass over the address list, starting at 1
        attempt: u32,
        error: io::ErrorKind,
    },
    /// `accept` on a listener failed with something other than WouldBlock
    AcceptFailed { server_id: ServerId, error: io::ErrorKind },
    /// An accepted socket was dropped because `max_channels` is reached
    ChannelLimit { server_id: ServerId, peer: SocketAddr },
}

/// Channel notifications for a pool
///
/// Every method has a default so handlers only implement what they need.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Inbound bytes on `channel`. `data` is everything buffered and not yet
    /// consumed; return how many leading bytes were consumed. Unconsumed
    /// bytes are offered again together with the next read.
    fn on_data(&self, pool: &ChannelPool, channel: ChannelId, data: &[u8]) -> usize {
        let _ = (pool, channel);
        data.len()
    }

    /// `channel` moved from `old` to `new`
    fn on_channel_state(
        &self,
        pool: &ChannelPool,
        channel: ChannelId,
        old: ChannelState,
        new: ChannelState,
        reason: StateReason,
    ) {
        let _ = (pool, channel, old, new, reason);
    }

    /// Flow-control notification for `channel`
    fn on_channel_alert(&self, pool: &ChannelPool, channel: ChannelId, alert: ChannelAlert) {
        let _ = (pool, channel, alert);
    }

    fn on_pool_event(&self, pool: &ChannelPool, event: &PoolEvent) {
        let _ = (pool, event);
    }
}

/// Handler that ignores everything and consumes all inbound data
impl ChannelHandler for () {}

/// Invoked on the channel's manager thread for each accepted connection
pub type AcceptCallback = Arc<dyn Fn(&ChannelPool, ServerId, ChannelId, SocketAddr) + Send + Sync>;

/// Invoked exactly once with the outcome of a `connect` call
pub type ConnectCallback = Box<dyn FnOnce(&ChannelPool, RequestId, Result<ChannelId>) + Send>;

/// Invoked on the clock's manager thread each time the clock fires
pub type ClockCallback = Box<dyn FnMut(&ChannelPool, ClockId) + Send>;
