//! Broker abstraction.
//!
//! The bus core treats the broker as an opaque store offering two primitives:
//!
//! - **Streams with consumer groups**: ordered, durable, append-only logs. Each
//!   entry is delivered to exactly one consumer within a group (competing
//!   consumers) and to every group (fan-out). Delivered entries stay pending
//!   for their consumer until acknowledged, and acknowledged entries are never
//!   delivered to that group again.
//! - **Lists**: simple FIFO queues with an expiry, used as per-process return
//!   paths for RPC results.
//! - **Values and sets**: expiring values plus sets of member names, used to
//!   share API schemas between processes.
//!
//! Implementations:
//! - `MemoryBroker`: in-process, for tests and single-process deployments
//! - `RedisBroker`: Redis streams and lists (feature `redis`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::codec::Fields;
use crate::config::{TransportConfig, TransportType};
use crate::message::Position;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("Invalid broker reply: {0}")]
    InvalidReply(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Only entries appended after the group is created.
    #[default]
    Latest,
    /// Every entry still retained by the stream.
    Beginning,
}

/// Which entries a group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries already delivered to this consumer but not yet acknowledged,
    /// starting after the given position (`Position::ZERO` for all of them).
    Pending(Position),
    /// Entries never delivered to any consumer of the group.
    New,
}

/// A stream entry handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub stream: String,
    pub position: Position,
    pub fields: Fields,
}

/// Interface the bus core requires from a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Check that the broker is reachable.
    async fn ping(&self) -> Result<()>;

    /// Append an entry to a stream, creating the stream if needed.
    async fn append(&self, stream: &str, fields: Fields) -> Result<Position>;

    /// Create a consumer group on a stream if it does not exist yet.
    ///
    /// Creating the stream as a side effect is allowed. An existing group keeps
    /// its position.
    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<()>;

    /// Read entries for `consumer` within `group` from any of `streams`.
    ///
    /// `ReadFrom::New` marks returned entries as pending for the consumer and
    /// waits up to `block` when nothing is available. `ReadFrom::Pending(_)`
    /// returns immediately, oldest entry first.
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Acknowledge an entry so it is never delivered to `group` again.
    async fn ack(&self, stream: &str, group: &str, position: Position) -> Result<()>;

    /// Take over entries pending for other consumers of `group` that have been
    /// idle for at least `min_idle` (their consumer most likely died).
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>>;

    /// Push a payload onto a list and (re)set the list's expiry.
    async fn push(&self, list: &str, payload: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Pop the oldest payload from a list, waiting up to `block`.
    async fn pop(&self, list: &str, block: Duration) -> Result<Option<Vec<u8>>>;

    /// Store a value that expires after `ttl` unless stored again.
    async fn set_value(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Read a value; expired and missing values are `None`.
    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Add a member to a set.
    async fn add_member(&self, set: &str, member: &str) -> Result<()>;

    /// Remove a member from a set.
    async fn remove_member(&self, set: &str, member: &str) -> Result<()>;

    /// Members of a set, sorted.
    async fn members(&self, set: &str) -> Result<Vec<String>>;
}

/// Initialize the broker selected by configuration.
pub async fn init_broker(
    config: &TransportConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.transport_type {
        TransportType::Memory => {
            info!(transport_type = "memory", "Broker initialized");
            Ok(Arc::new(MemoryBroker::with_stream_max_len(
                config.redis.stream_max_len,
            )))
        }
        TransportType::Redis => {
            #[cfg(feature = "redis")]
            {
                let broker = RedisBroker::new(&config.redis).await?;
                info!(transport_type = "redis", url = %config.redis.url, "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err("Redis support requires the 'redis' feature. Rebuild with --features redis".into())
            }
        }
    }
}
