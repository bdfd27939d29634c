//! Transport adapter.
//!
//! Maps bus concepts onto broker primitives and applies the codec:
//!
//! | Concept | Broker key | Consumer group |
//! |---|---|---|
//! | RPC requests for an API | `{prefix}:{api}:rpc_queue` (stream) | `rpc_workers` |
//! | RPC results for a process | `{prefix}:{process}:results` (list) | - |
//! | Events `api.event` | `{prefix}:{api}.{event}:events` (stream) | `{service_name}` |
//! | Schema of an API | `{prefix}:schema:{api}` (value with TTL) | - |
//! | Names of shared schemas | `{prefix}:schemas` (set) | - |
//!
//! Every process serving an API joins the same `rpc_workers` group, so each
//! request reaches exactly one of them. Event groups are per service: every
//! service sees every event, processes within a service share the work.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use crate::api::ApiSchema;
use crate::broker::{Broker, Delivery, ReadFrom, StartFrom};
use crate::codec::{pack_fields, unpack_fields, Codec, CodecError};
use crate::config::Config;
use crate::error::Result;
use crate::message::{BusMessage, EventMessage, Position, ResultMessage, RpcMessage};

/// Consumer group shared by every process serving an API.
pub const RPC_GROUP: &str = "rpc_workers";

/// A decoded message with the stream position it was read from.
#[derive(Debug, Clone)]
pub struct Inbound<M> {
    pub stream: String,
    pub position: Position,
    pub message: M,
}

pub struct TransportAdapter {
    broker: Arc<dyn Broker>,
    codec: Codec,
    key_prefix: String,
    service_name: String,
    process_name: String,
    result_ttl: Duration,
    batch_size: usize,
    block: Duration,
    reclaim_idle: Duration,
}

impl TransportAdapter {
    pub fn new(broker: Arc<dyn Broker>, config: &Config) -> Self {
        let redis = &config.transport.redis;
        Self {
            broker,
            codec: config.codec,
            key_prefix: redis.key_prefix.clone(),
            service_name: config.service_name.clone(),
            process_name: config.process_name.clone(),
            result_ttl: Duration::from_secs(redis.result_ttl_secs),
            batch_size: redis.batch_size,
            block: Duration::from_millis(redis.block_ms),
            reclaim_idle: Duration::from_millis(redis.reclaim_idle_ms),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn rpc_queue(&self, api: &str) -> String {
        format!("{}:{}:rpc_queue", self.key_prefix, api)
    }

    pub fn event_stream(&self, api: &str, event: &str) -> String {
        format!("{}:{}.{}:events", self.key_prefix, api, event)
    }

    /// Return path of this process.
    pub fn return_path(&self) -> String {
        format!("{}:{}:results", self.key_prefix, self.process_name)
    }

    pub fn rpc_streams(&self, apis: &[String]) -> Vec<String> {
        apis.iter().map(|api| self.rpc_queue(api)).collect()
    }

    pub fn event_streams(&self, keys: &[(String, String)]) -> Vec<String> {
        keys.iter()
            .map(|(api, event)| self.event_stream(api, event))
            .collect()
    }

    pub fn schema_key(&self, api: &str) -> String {
        format!("{}:schema:{}", self.key_prefix, api)
    }

    pub fn schema_index(&self) -> String {
        format!("{}:schemas", self.key_prefix)
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.broker.ping().await?)
    }

    // ------------------------------------------------------------------------
    // RPC
    // ------------------------------------------------------------------------

    pub async fn send_request(&self, request: &RpcMessage) -> Result<Position> {
        let fields = self.codec.encode(request)?;
        let stream = self.rpc_queue(&request.api_name);
        let position = self.broker.append(&stream, fields).await?;
        debug!(
            correlation_id = %request.id,
            api = %request.api_name,
            method = %request.procedure_name,
            position = %position,
            "Sent RPC request"
        );
        Ok(position)
    }

    /// Join the RPC consumer group of every served API.
    ///
    /// Requests sent before the first server started are still served.
    pub async fn prepare_rpc_consumer(&self, streams: &[String]) -> Result<()> {
        for stream in streams {
            self.broker
                .ensure_group(stream, RPC_GROUP, StartFrom::Beginning)
                .await?;
        }
        Ok(())
    }

    pub async fn next_requests(
        &self,
        streams: &[String],
        from: ReadFrom,
    ) -> Result<Vec<Inbound<RpcMessage>>> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let deliveries = self
            .broker
            .read_group(
                streams,
                RPC_GROUP,
                &self.process_name,
                from,
                self.batch_size,
                self.block,
            )
            .await?;
        self.decode_all(deliveries, RPC_GROUP).await
    }

    /// Take over requests left pending by a process that stopped consuming.
    pub async fn claim_idle_requests(&self, streams: &[String]) -> Result<Vec<Inbound<RpcMessage>>> {
        let mut out = Vec::new();
        for stream in streams {
            let deliveries = self
                .broker
                .claim_idle(
                    stream,
                    RPC_GROUP,
                    &self.process_name,
                    self.reclaim_idle,
                    self.batch_size,
                )
                .await?;
            out.extend(self.decode_all(deliveries, RPC_GROUP).await?);
        }
        Ok(out)
    }

    /// Every request delivered to this process and not yet acknowledged.
    pub async fn own_pending_requests(
        &self,
        streams: &[String],
    ) -> Result<Vec<Inbound<RpcMessage>>> {
        let deliveries = self.read_own_pending(streams, RPC_GROUP).await?;
        self.decode_all(deliveries, RPC_GROUP).await
    }

    pub async fn ack_request(&self, stream: &str, position: Position) -> Result<()> {
        Ok(self.broker.ack(stream, RPC_GROUP, position).await?)
    }

    pub async fn send_result(&self, request: &RpcMessage, result: &ResultMessage) -> Result<()> {
        let payload = pack_fields(&self.codec.encode(result)?)?;
        self.broker
            .push(&request.return_path, payload, self.result_ttl)
            .await?;
        debug!(
            correlation_id = %result.rpc_id,
            return_path = %request.return_path,
            error = result.error,
            "Sent RPC result"
        );
        Ok(())
    }

    /// Wait up to the read window for the next result addressed to this process.
    pub async fn next_result(&self) -> Result<Option<ResultMessage>> {
        let Some(payload) = self.broker.pop(&self.return_path(), self.block).await? else {
            return Ok(None);
        };
        let decoded = unpack_fields(&payload).and_then(|fields| self.codec.decode(&fields));
        match decoded {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                error!(error = %e, "Discarding undecodable RPC result");
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub async fn send_event(&self, event: &EventMessage) -> Result<Position> {
        let fields = self.codec.encode(event)?;
        let stream = self.event_stream(&event.api_name, &event.event_name);
        let position = self.broker.append(&stream, fields).await?;
        debug!(
            api = %event.api_name,
            event = %event.event_name,
            position = %position,
            "Sent event"
        );
        Ok(position)
    }

    /// Join this service's consumer group on each event stream.
    pub async fn prepare_event_consumer(&self, streams: &[String], start: StartFrom) -> Result<()> {
        for stream in streams {
            self.broker
                .ensure_group(stream, &self.service_name, start)
                .await?;
        }
        Ok(())
    }

    pub async fn next_events(
        &self,
        streams: &[String],
        from: ReadFrom,
    ) -> Result<Vec<Inbound<EventMessage>>> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let deliveries = self
            .broker
            .read_group(
                streams,
                &self.service_name,
                &self.process_name,
                from,
                self.batch_size,
                self.block,
            )
            .await?;
        let events = self.decode_all(deliveries, &self.service_name).await?;
        Ok(events.into_iter().map(with_position).collect())
    }

    pub async fn claim_idle_events(&self, streams: &[String]) -> Result<Vec<Inbound<EventMessage>>> {
        let mut out = Vec::new();
        for stream in streams {
            let deliveries = self
                .broker
                .claim_idle(
                    stream,
                    &self.service_name,
                    &self.process_name,
                    self.reclaim_idle,
                    self.batch_size,
                )
                .await?;
            let events = self.decode_all(deliveries, &self.service_name).await?;
            out.extend(events.into_iter().map(with_position));
        }
        Ok(out)
    }

    /// Every event delivered to this process and not yet acknowledged.
    pub async fn own_pending_events(
        &self,
        streams: &[String],
    ) -> Result<Vec<Inbound<EventMessage>>> {
        let deliveries = self.read_own_pending(streams, &self.service_name).await?;
        let events = self.decode_all(deliveries, &self.service_name).await?;
        Ok(events.into_iter().map(with_position).collect())
    }

    pub async fn ack_event(&self, stream: &str, position: Position) -> Result<()> {
        Ok(self
            .broker
            .ack(stream, &self.service_name, position)
            .await?)
    }

    // ------------------------------------------------------------------------
    // Schemas
    // ------------------------------------------------------------------------

    /// Share a schema with other processes until `ttl` passes without a refresh.
    #[instrument(skip_all, fields(api = %schema.name))]
    pub async fn store_schema(&self, schema: &ApiSchema, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_vec(schema).map_err(CodecError::from)?;
        self.broker
            .set_value(&self.schema_key(&schema.name), payload, ttl)
            .await?;
        self.broker
            .add_member(&self.schema_index(), &schema.name)
            .await?;
        debug!("Stored API schema");
        Ok(())
    }

    /// Schemas currently shared by any process. Expired entries are
    /// removed from the index, undecodable ones are skipped.
    pub async fn load_schemas(&self) -> Result<Vec<ApiSchema>> {
        let index = self.schema_index();
        let mut schemas = Vec::new();
        for name in self.broker.members(&index).await? {
            let Some(payload) = self.broker.get_value(&self.schema_key(&name)).await? else {
                debug!(api = %name, "Shared schema expired");
                self.broker.remove_member(&index, &name).await?;
                continue;
            };
            match serde_json::from_slice::<ApiSchema>(&payload) {
                Ok(schema) => schemas.push(schema),
                Err(e) => warn!(api = %name, error = %e, "Skipping undecodable shared schema"),
            }
        }
        Ok(schemas)
    }

    /// Page through this consumer's pending entries, one stream at a time.
    async fn read_own_pending(&self, streams: &[String], group: &str) -> Result<Vec<Delivery>> {
        let mut out = Vec::new();
        for stream in streams {
            let mut after = Position::ZERO;
            loop {
                let batch = self
                    .broker
                    .read_group(
                        std::slice::from_ref(stream),
                        group,
                        &self.process_name,
                        ReadFrom::Pending(after),
                        self.batch_size,
                        Duration::ZERO,
                    )
                    .await?;
                let Some(last) = batch.last() else {
                    break;
                };
                after = last.position;
                out.extend(batch);
            }
        }
        Ok(out)
    }

    /// Decode deliveries. Entries that cannot be decoded will never succeed,
    /// so they are logged and acknowledged instead of being returned.
    async fn decode_all<M: BusMessage>(
        &self,
        deliveries: Vec<Delivery>,
        group: &str,
    ) -> Result<Vec<Inbound<M>>> {
        let mut out = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match self.codec.decode::<M>(&delivery.fields) {
                Ok(message) => out.push(Inbound {
                    stream: delivery.stream,
                    position: delivery.position,
                    message,
                }),
                Err(e) => {
                    error!(
                        stream = %delivery.stream,
                        position = %delivery.position,
                        kind = M::KIND,
                        error = %e,
                        "Failed to decode message, acknowledging"
                    );
                    self.broker
                        .ack(&delivery.stream, group, delivery.position)
                        .await?;
                }
            }
        }
        Ok(out)
    }
}

fn with_position(mut inbound: Inbound<EventMessage>) -> Inbound<EventMessage> {
    inbound.message.position = Some(inbound.position);
    inbound
}
