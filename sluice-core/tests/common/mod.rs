//! Shared helpers for channel pool integration tests
//!
//! Every callback is forwarded into a crossbeam channel so tests can wait on
//! pool activity with a bounded `recv_timeout`.

#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use sluice_core::{
    ChannelAlert, ChannelHandler, ChannelId, ChannelPool, ChannelState, ConnectOptions, PoolConfig,
    PoolEvent, Result, StateReason,
};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

/// A callback observed by the recorder
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    /// Bytes offered to `on_data`, with the name of the delivering thread
    Data { channel: ChannelId, bytes: Vec<u8>, thread: String },
    State { channel: ChannelId, old: ChannelState, new: ChannelState, reason: StateReason },
    Alert { channel: ChannelId, alert: ChannelAlert },
    Pool(PoolEvent),
}

/// Handler forwarding every callback to a channel
pub struct Recorder {
    tx: Sender<Seen>,
    /// When false, `on_data` consumes nothing
    consume: Arc<AtomicBool>,
}

impl ChannelHandler for Recorder {
    fn on_data(&self, _pool: &ChannelPool, channel: ChannelId, data: &[u8]) -> usize {
        let thread = thread::current().name().unwrap_or_default().to_string();
        let _ = self.tx.send(Seen::Data { channel, bytes: data.to_vec(), thread });
        if self.consume.load(Ordering::SeqCst) {
            data.len()
        } else {
            0
        }
    }

    fn on_channel_state(
        &self,
        _pool: &ChannelPool,
        channel: ChannelId,
        old: ChannelState,
        new: ChannelState,
        reason: StateReason,
    ) {
        let _ = self.tx.send(Seen::State { channel, old, new, reason });
    }

    fn on_channel_alert(&self, _pool: &ChannelPool, channel: ChannelId, alert: ChannelAlert) {
        let _ = self.tx.send(Seen::Alert { channel, alert });
    }

    fn on_pool_event(&self, _pool: &ChannelPool, event: &PoolEvent) {
        let _ = self.tx.send(Seen::Pool(event.clone()));
    }
}

pub struct Harness {
    pub pool: ChannelPool,
    pub events: Receiver<Seen>,
    pub consume: Arc<AtomicBool>,
}

impl Harness {
    pub fn new(config: PoolConfig) -> Self {
        let (tx, events) = crossbeam_channel::unbounded();
        let consume = Arc::new(AtomicBool::new(true));
        let recorder = Recorder { tx, consume: consume.clone() };
        let pool = ChannelPool::new(config, recorder).expect("pool starts");
        Self { pool, events, consume }
    }

    /// Wait until `pick` accepts an event, dropping the ones before it
    pub fn wait_for<T>(&self, mut pick: impl FnMut(&Seen) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(seen) => {
                    if let Some(found) = pick(&seen) {
                        return found;
                    }
                }
                Err(_) => panic!("timed out waiting for pool event"),
            }
        }
    }

    /// Collect `len` inbound bytes of `channel`
    pub fn read_exact(&self, channel: ChannelId, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = self.wait_for(|seen| match seen {
                Seen::Data { channel: c, bytes, .. } if *c == channel => Some(bytes.clone()),
                _ => None,
            });
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Wait for the final state of `channel`
    pub fn wait_terminal(&self, channel: ChannelId) -> (ChannelState, StateReason) {
        self.wait_for(|seen| match seen {
            Seen::State { channel: c, new, reason, .. } if *c == channel && new.is_terminal() => {
                Some((*new, *reason))
            }
            _ => None,
        })
    }

    /// Everything recorded within `window`
    pub fn drain_for(&self, window: Duration) -> Vec<Seen> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(event) = self.events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            seen.push(event);
        }
        seen
    }

    /// Connect and wait for the result
    pub fn connect(&self, addresses: &[SocketAddr], options: ConnectOptions) -> Result<ChannelId> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pool.connect(addresses, options, move |_, _, result| {
            let _ = tx.send(result);
        })?;
        rx.recv_timeout(WAIT).expect("connect result delivered")
    }
}

/// Small, fast-stopping configuration
pub fn test_config() -> PoolConfig {
    PoolConfig {
        thread_count: 2,
        poll_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        retry_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// A loopback address nobody listens on
pub fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr")
}

pub fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}
