//! Round-trip client used by `sluice ping`

use crate::config::ProfileConfig;
use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use sluice_core::timer::deadline_after;
use sluice_core::{ChannelHandler, ChannelId, ChannelPool, ChannelState, ConnectOptions, PoolEvent, StateReason};
use std::fmt;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

enum Reply {
    Data(Vec<u8>),
    Closed(StateReason),
}

/// Forwards echoed bytes to the waiting ping loop
struct PingHandler {
    tx: Sender<Reply>,
}

impl ChannelHandler for PingHandler {
    fn on_data(&self, _pool: &ChannelPool, _channel: ChannelId, data: &[u8]) -> usize {
        let _ = self.tx.send(Reply::Data(data.to_vec()));
        data.len()
    }

    fn on_channel_state(
        &self,
        _pool: &ChannelPool,
        _channel: ChannelId,
        _old: ChannelState,
        new: ChannelState,
        reason: StateReason,
    ) {
        if new.is_terminal() {
            let _ = self.tx.send(Reply::Closed(reason));
        }
    }

    fn on_pool_event(&self, _pool: &ChannelPool, event: &PoolEvent) {
        if let PoolEvent::ConnectAttemptFailed { address, attempt, error, .. } = event {
            tracing::info!(%address, attempt, "connect attempt failed: {error}");
        }
    }
}

/// Measured round trips of one ping run
#[derive(Debug, Clone)]
pub struct PingReport {
    pub peer: SocketAddr,
    pub payload_size: usize,
    pub rtts: Vec<Duration>,
}

impl PingReport {
    pub fn min(&self) -> Option<Duration> {
        self.rtts.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.rtts.iter().max().copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.rtts.len()).ok().filter(|n| *n > 0)?;
        Some(self.rtts.iter().sum::<Duration>() / count)
    }
}

impl fmt::Display for PingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} round trips of {} bytes to {}", self.rtts.len(), self.payload_size, self.peer)?;
        if let (Some(min), Some(mean), Some(max)) = (self.min(), self.mean(), self.max()) {
            write!(f, ": min {min:?}, avg {mean:?}, max {max:?}")?;
        }
        Ok(())
    }
}

/// Connect to the first reachable target, send `count` probes and time each echo
pub fn run(profile: &ProfileConfig) -> Result<PingReport> {
    let targets = profile.ping_targets()?;
    if targets.is_empty() {
        bail!("No ping target given");
    }

    let (tx, replies) = crossbeam_channel::unbounded();
    let pool = ChannelPool::new(profile.pool.clone(), PingHandler { tx })?;
    let result = ping_on(&pool, &targets, profile, &replies);
    pool.shutdown()?;
    result
}

fn ping_on(
    pool: &ChannelPool,
    targets: &[SocketAddr],
    profile: &ProfileConfig,
    replies: &Receiver<Reply>,
) -> Result<PingReport> {
    let options = ConnectOptions::from_config(&profile.pool);
    let (tx, connected) = crossbeam_channel::bounded(1);
    pool.connect(targets, options, move |_, _, result| {
        let _ = tx.send(result);
    })?;

    let channel = connected
        .recv_timeout(connect_budget(&options, targets.len()))
        .context("No connect result")??;
    let peer = pool.peer_address(channel)?;
    tracing::info!(%peer, "connected");

    let settings = &profile.ping;
    let mut rtts = Vec::with_capacity(settings.count as usize);
    for seq in 0..settings.count {
        let payload: Vec<u8> = (0..settings.payload_size).map(|i| (i as u32 + seq) as u8).collect();

        let started = Instant::now();
        pool.send(channel, payload.clone())?;
        let echoed = await_echo(replies, payload.len(), deadline_after(started, settings.reply_timeout))
            .with_context(|| format!("Probe {seq} to {peer}"))?;
        let rtt = started.elapsed();

        if echoed != payload {
            bail!("Probe {seq}: echo does not match what was sent");
        }
        tracing::debug!(seq, rtt = ?rtt, "reply");
        rtts.push(rtt);

        if seq + 1 < settings.count && !settings.interval.is_zero() {
            thread::sleep(settings.interval);
        }
    }

    pool.close(channel, true)?;
    Ok(PingReport { peer, payload_size: settings.payload_size, rtts })
}

/// How long a connect request may take before its result is overdue
///
/// Every attempt may use the full timeout, plus the waits between passes and
/// a second of slack. Saturates for unbounded settings.
fn connect_budget(options: &ConnectOptions, targets: usize) -> Duration {
    let attempts = u32::try_from(targets).unwrap_or(u32::MAX).saturating_mul(options.max_attempts);
    options
        .timeout
        .saturating_mul(attempts)
        .saturating_add(options.retry_interval.saturating_mul(options.max_attempts))
        .saturating_add(Duration::from_secs(1))
}

fn await_echo(replies: &Receiver<Reply>, len: usize, deadline: Instant) -> Result<Vec<u8>> {
    let mut echoed = Vec::with_capacity(len);
    while echoed.len() < len {
        let left = deadline.saturating_duration_since(Instant::now());
        match replies.recv_timeout(left) {
            Ok(Reply::Data(bytes)) => echoed.extend_from_slice(&bytes),
            Ok(Reply::Closed(reason)) => bail!("Channel closed before the echo arrived ({reason:?})"),
            Err(_) => bail!("Timed out after {} of {len} bytes", echoed.len()),
        }
    }
    Ok(echoed)
}
