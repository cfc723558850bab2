//! Broker adapters for the [`taskforge_transport::Transport`] contract.
//!
//! The in-memory broker lives in `taskforge-transport` itself.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisConfig, RedisStreamsTransport};
