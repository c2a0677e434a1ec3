//! Sluice CLI library
//!
//! Exposes the profile types and the echo/ping building blocks so the
//! binary and the integration tests share them.

pub mod config;
pub mod echo;
pub mod ping;
