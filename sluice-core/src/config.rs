//! Configuration types for the channel pool
//!
//! `PoolConfig` is an immutable value handed to [`ChannelPool::new`]. Every
//! field has a default so partial TOML profiles deserialize cleanly.
//!
//! [`ChannelPool::new`]: crate::ChannelPool::new

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sluice_transport::MultiplexerType;
use std::time::Duration;

/// Channel pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of event manager threads
    pub thread_count: usize,
    /// Unconsumed inbound bytes per channel before automatic reading is suspended
    pub read_high_water_mark: usize,
    /// Queued outbound bytes per channel above which `send` reports backpressure
    pub write_high_water_mark: usize,
    /// Queued outbound bytes at or below which a low-water alert fires
    pub write_low_water_mark: usize,
    /// Time allowed for a single address connect attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Passes over the address list before a connect request fails
    pub max_connect_attempts: u32,
    /// Delay between two passes over the address list
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Accept backlog used by `listen_default`
    pub listen_backlog: u32,
    /// Readiness backend: epoll, poll, select (Linux) or mio
    pub multiplexer: String,
    /// Upper bound on a single multiplexer wait
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bytes requested from the socket per read
    pub read_chunk_size: usize,
    /// Time shutdown lets channels drain their write queues before forcing them closed
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Maximum number of open channels (None = unlimited)
    pub max_channels: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_count: 2,
            read_high_water_mark: 1 << 20,
            write_high_water_mark: 1 << 20,
            write_low_water_mark: 256 << 10,
            connect_timeout: Duration::from_secs(5),
            max_connect_attempts: 3,
            retry_interval: Duration::from_secs(1),
            listen_backlog: 128,
            multiplexer: MultiplexerType::default().to_string(),
            poll_interval: Duration::from_millis(100),
            read_chunk_size: 8192,
            shutdown_grace: Duration::from_secs(1),
            max_channels: None,
        }
    }
}

impl PoolConfig {
    /// Check every field, returning the first violation
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(Error::Config("thread_count must be at least 1".to_string()));
        }
        if self.max_connect_attempts == 0 {
            return Err(Error::Config("max_connect_attempts must be at least 1".to_string()));
        }
        if self.listen_backlog == 0 {
            return Err(Error::Config("listen_backlog must be at least 1".to_string()));
        }
        if self.write_low_water_mark > self.write_high_water_mark {
            return Err(Error::Config(format!(
                "write_low_water_mark ({}) exceeds write_high_water_mark ({})",
                self.write_low_water_mark, self.write_high_water_mark
            )));
        }
        if self.read_chunk_size == 0 {
            return Err(Error::Config("read_chunk_size must be at least 1".to_string()));
        }
        if self.read_high_water_mark < self.read_chunk_size {
            return Err(Error::Config(format!(
                "read_high_water_mark ({}) is smaller than read_chunk_size ({})",
                self.read_high_water_mark, self.read_chunk_size
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be positive".to_string()));
        }
        if self.max_channels == Some(0) {
            return Err(Error::Config("max_channels must be at least 1 when set".to_string()));
        }
        self.multiplexer_type()?;
        Ok(())
    }

    /// Parsed multiplexer backend
    pub fn multiplexer_type(&self) -> Result<MultiplexerType> {
        Ok(self.multiplexer.parse::<MultiplexerType>()?)
    }

    /// Connect options derived from this configuration
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: self.connect_timeout,
            max_attempts: self.max_connect_attempts,
            retry_interval: self.retry_interval,
        }
    }
}

/// Retry policy for a single `connect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Time allowed for each address attempt
    pub timeout: Duration,
    /// Passes over the address list (at least 1)
    pub max_attempts: u32,
    /// Delay between passes
    pub retry_interval: Duration,
}

impl ConnectOptions {
    pub fn new(timeout: Duration, max_attempts: u32, retry_interval: Duration) -> Self {
        Self { timeout, max_attempts, retry_interval }
    }

    /// The pool-wide defaults from `config`
    pub fn from_config(config: &PoolConfig) -> Self {
        config.connect_options()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("connect timeout must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        PoolConfig::default().connect_options()
    }
}
