//! Redis broker.
//!
//! Streams map onto Redis streams (`XADD`, `XREADGROUP`, `XACK`, `XCLAIM`) and
//! lists onto Redis lists (`RPUSH` + `EXPIRE`, `BLPOP`).
//!
//! Schemas use plain values (`SET ... EX`, `GET`) and sets (`SADD`, `SREM`,
//! `SMEMBERS`).
//!
//! Non-blocking commands share one `ConnectionManager`. Blocking reads would
//! stall every other command pipelined on that connection, so they run on
//! dedicated connections kept in a small idle pool.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Broker, BrokerError, Delivery, ReadFrom, Result, StartFrom};
use crate::codec::Fields;
use crate::config::RedisConfig;
use crate::message::Position;

/// Dedicated connections kept around for blocking commands.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Redis streams broker.
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    idle: Mutex<Vec<MultiplexedConnection>>,
    stream_max_len: Option<usize>,
}

impl RedisBroker {
    /// Connect to Redis with a single attempt.
    ///
    /// Retrying is left to the caller, which bounds it by its own startup
    /// and reconnect policy.
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let manager_config = ConnectionManagerConfig::new().set_number_of_retries(0);
        let conn = ConnectionManager::new_with_config(client.clone(), manager_config).await?;

        info!(url = %config.url, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            idle: Mutex::new(Vec::new()),
            stream_max_len: (config.stream_max_len > 0).then_some(config.stream_max_len),
        })
    }

    async fn checkout(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Return a connection to the pool. Only call after a successful command;
    /// a connection that saw an error is dropped.
    async fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    fn to_delivery(stream: &str, entry: StreamId) -> Result<Delivery> {
        let position: Position = entry
            .id
            .parse()
            .map_err(|e: crate::codec::CodecError| BrokerError::InvalidReply(e.to_string()))?;
        let mut fields = Fields::with_capacity(entry.map.len());
        for (name, value) in entry.map {
            let value: String = redis::from_redis_value(&value)?;
            fields.push((name, value));
        }
        Ok(Delivery {
            stream: stream.to_string(),
            position,
            fields,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<Position> {
        let mut conn = self.conn.clone();
        let id: String = match self.stream_max_len {
            Some(max_len) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", fields.as_slice())
                    .await?
            }
            None => conn.xadd(stream, "*", fields.as_slice()).await?,
        };
        debug!(stream = %stream, id = %id, "Appended to Redis stream");
        id.parse()
            .map_err(|e: crate::codec::CodecError| BrokerError::InvalidReply(e.to_string()))
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<()> {
        let mut conn = self.conn.clone();
        let from = match start {
            StartFrom::Latest => "$",
            StartFrom::Beginning => "0",
        };
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, from).await;
        match created {
            Ok(()) => {
                debug!(stream = %stream, group = %group, from = %from, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let id = match from {
            ReadFrom::Pending(after) => after.to_string(),
            ReadFrom::New => ">".to_string(),
        };
        let ids = vec![id.as_str(); streams.len()];
        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        // BLOCK 0 means forever in Redis; omit it for a non-blocking read.
        let blocking = from == ReadFrom::New && !block.is_zero();
        if blocking {
            options = options.block(block.as_millis().max(1) as usize);
        }

        loop {
            let reply: Option<StreamReadReply> = if blocking {
                let mut conn = self.checkout().await?;
                let reply = conn.xread_options(streams, ids.as_slice(), &options).await?;
                self.checkin(conn).await;
                reply
            } else {
                let mut conn = self.conn.clone();
                conn.xread_options(streams, ids.as_slice(), &options).await?
            };

            let mut out = Vec::new();
            let mut trimmed = 0usize;
            for key in reply.map(|r| r.keys).unwrap_or_default() {
                for entry in key.ids {
                    // Pending entries trimmed from the stream come back empty
                    // and can never be served.
                    if entry.map.is_empty() {
                        let mut conn = self.conn.clone();
                        let _: i64 = conn.xack(&key.key, group, &[entry.id.as_str()]).await?;
                        trimmed += 1;
                        continue;
                    }
                    out.push(Self::to_delivery(&key.key, entry)?);
                }
            }
            if trimmed > 0 {
                debug!(trimmed, group = %group, "Acknowledged pending entries trimmed from the stream");
                if out.is_empty() {
                    continue;
                }
            }
            return Ok(out);
        }
    }

    async fn ack(&self, stream: &str, group: &str, position: Position) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[position.to_string()]).await?;
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply =
            match conn.xpending_count(stream, group, "-", "+", count).await {
                Ok(reply) => reply,
                Err(e) if e.code() == Some("NOGROUP") => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

        let min_idle_ms = min_idle.as_millis() as usize;
        let ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != consumer && p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await?;
        claimed
            .ids
            .into_iter()
            .filter(|entry| !entry.map.is_empty())
            .map(|entry| Self::to_delivery(stream, entry))
            .collect()
    }

    async fn push(&self, list: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(list)
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(list)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, list: &str, block: Duration) -> Result<Option<Vec<u8>>> {
        if block.is_zero() {
            let mut conn = self.conn.clone();
            let payload: Option<Vec<u8>> = redis::cmd("LPOP").arg(list).query_async(&mut conn).await?;
            return Ok(payload);
        }

        let mut conn = self.checkout().await?;
        let reply: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(list)
            .arg(block.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        self.checkin(conn).await;
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn set_value(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, payload, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(set, member).await?;
        Ok(())
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(set, member).await?;
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(set).await?;
        members.sort();
        Ok(members)
    }
}
