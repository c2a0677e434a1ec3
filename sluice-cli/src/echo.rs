//! Echo handler used by `sluice serve`

use sluice_core::{ChannelAlert, ChannelHandler, ChannelId, ChannelPool, ChannelState, PoolEvent, SendStatus, StateReason};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters shared between the handler and whoever reports on it
#[derive(Debug, Default)]
pub struct EchoStats {
    pub channels: AtomicU64,
    pub bytes_echoed: AtomicU64,
    /// Times a reply was held back because the peer stopped reading
    pub stalls: AtomicU64,
}

/// Writes every inbound byte back to its sender
///
/// When the write queue is over its high-water mark the data is left
/// unconsumed; the pool keeps buffering it (and eventually suspends reading)
/// until the low-water alert re-enables reading and the data is offered again.
#[derive(Debug, Default, Clone)]
pub struct EchoHandler {
    stats: Arc<EchoStats>,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<EchoStats> {
        self.stats.clone()
    }
}

impl ChannelHandler for EchoHandler {
    fn on_data(&self, pool: &ChannelPool, channel: ChannelId, data: &[u8]) -> usize {
        match pool.send(channel, data) {
            Ok(SendStatus::Rejected) => {
                self.stats.stalls.fetch_add(1, Ordering::Relaxed);
                0
            }
            Ok(_) => {
                self.stats.bytes_echoed.fetch_add(data.len() as u64, Ordering::Relaxed);
                data.len()
            }
            // Closing: nothing left to echo to
            Err(_) => data.len(),
        }
    }

    fn on_channel_state(
        &self,
        pool: &ChannelPool,
        channel: ChannelId,
        _old: ChannelState,
        new: ChannelState,
        reason: StateReason,
    ) {
        match new {
            ChannelState::Connected => {
                self.stats.channels.fetch_add(1, Ordering::Relaxed);
                let peer = pool.peer_address(channel).ok();
                tracing::info!(channel = %channel, peer = ?peer, "client connected");
            }
            ChannelState::Closed => tracing::info!(channel = %channel, "client disconnected ({reason:?})"),
            ChannelState::Failed => tracing::warn!(channel = %channel, "channel failed ({reason:?})"),
            _ => {}
        }
    }

    fn on_channel_alert(&self, pool: &ChannelPool, channel: ChannelId, alert: ChannelAlert) {
        tracing::debug!(channel = %channel, ?alert, "flow control");
        if alert == ChannelAlert::LowWater {
            // Offer whatever was held back while the queue was full
            let _ = pool.enable_read(channel);
        }
    }

    fn on_pool_event(&self, _pool: &ChannelPool, event: &PoolEvent) {
        tracing::warn!("{event:?}");
    }
}
