//! Sluice Core Library
//!
//! A thread-pooled TCP channel engine: a fixed set of event manager threads
//! multiplex readiness over many sockets, a connector thread drives outbound
//! connects with retry and address failover, and per-channel write queues
//! apply high/low-water backpressure.
//!
//! The entry point is [`ChannelPool`]; notifications arrive through a
//! [`ChannelHandler`].

pub mod balancer;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
mod event_manager;
pub mod handler;
pub mod listener;
pub mod pool;
pub mod timer;
pub mod write_queue;

pub use channel::{ChannelAlert, ChannelId, ChannelState, ChannelStats, SendStatus, StateReason};
pub use clock::ClockId;
pub use config::{ConnectOptions, PoolConfig};
pub use connector::RequestId;
pub use error::{Error, Result};
pub use handler::{ChannelHandler, PoolEvent};
pub use listener::ServerId;
pub use pool::{ChannelPool, PoolTotals};

// Re-export the backend selector so callers need not depend on the transport crate
pub use sluice_transport::MultiplexerType;
