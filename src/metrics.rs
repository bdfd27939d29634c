//! Internal `internal.metrics` API.
//!
//! With `metrics.enabled`, a bus serves this API and publishes one event per
//! RPC or event it sends or receives. Payloads carry identifiers only, never
//! the keyword parameters of the message they describe.

use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use crate::api::{Api, ApiSchema};
use crate::config::Config;
use crate::error::Result;
use crate::message::{EventMessage, Kwargs, ResultMessage, RpcMessage};
use crate::transport::TransportAdapter;

pub const METRICS_API: &str = "internal.metrics";
pub const RPC_CALL_SENT: &str = "rpc_call_sent";
pub const RPC_CALL_RECEIVED: &str = "rpc_call_received";
pub const RPC_RESPONSE_SENT: &str = "rpc_response_sent";
pub const RPC_RESPONSE_RECEIVED: &str = "rpc_response_received";
pub const EVENT_FIRED: &str = "event_fired";
pub const EVENT_RECEIVED: &str = "event_received";

const RPC_PARAMETERS: [&str; 4] = ["process_name", "id", "api_name", "procedure_name"];
const RESPONSE_PARAMETERS: [&str; 5] = ["process_name", "id", "api_name", "procedure_name", "error"];
const EVENT_PARAMETERS: [&str; 4] = ["process_name", "id", "api_name", "event_name"];

/// APIs whose traffic is never recorded.
const INTERNAL_PREFIX: &str = "internal.";

pub fn metrics_api() -> Result<Api> {
    Api::builder(METRICS_API)
        .event(RPC_CALL_SENT, RPC_PARAMETERS)
        .event(RPC_CALL_RECEIVED, RPC_PARAMETERS)
        .event(RPC_RESPONSE_SENT, RESPONSE_PARAMETERS)
        .event(RPC_RESPONSE_RECEIVED, RESPONSE_PARAMETERS)
        .event(EVENT_FIRED, EVENT_PARAMETERS)
        .event(EVENT_RECEIVED, EVENT_PARAMETERS)
        .build()
}

/// Schema for processes that only listen to metrics.
pub fn metrics_schema() -> ApiSchema {
    ApiSchema::new(METRICS_API)
        .event(RPC_CALL_SENT, RPC_PARAMETERS)
        .event(RPC_CALL_RECEIVED, RPC_PARAMETERS)
        .event(RPC_RESPONSE_SENT, RESPONSE_PARAMETERS)
        .event(RPC_RESPONSE_RECEIVED, RESPONSE_PARAMETERS)
        .event(EVENT_FIRED, EVENT_PARAMETERS)
        .event(EVENT_RECEIVED, EVENT_PARAMETERS)
}

/// Publishes `internal.metrics` events on behalf of the RPC and event engines.
///
/// A failed publish is logged and never fails the operation being recorded.
pub struct MetricsRecorder {
    transport: Arc<TransportAdapter>,
    process_name: String,
    enabled: bool,
}

impl MetricsRecorder {
    pub fn new(transport: Arc<TransportAdapter>, config: &Config) -> Self {
        Self {
            transport,
            process_name: config.process_name.clone(),
            enabled: config.metrics.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn rpc_call_sent(&self, request: &RpcMessage) {
        self.record(&request.api_name, RPC_CALL_SENT, || self.rpc_kwargs(request))
            .await
    }

    pub async fn rpc_call_received(&self, request: &RpcMessage) {
        self.record(&request.api_name, RPC_CALL_RECEIVED, || self.rpc_kwargs(request))
            .await
    }

    pub async fn rpc_response_sent(&self, request: &RpcMessage, result: &ResultMessage) {
        self.record(&request.api_name, RPC_RESPONSE_SENT, || {
            let mut kwargs = self.rpc_kwargs(request);
            kwargs.insert("error".to_string(), json!(result.error));
            kwargs
        })
        .await
    }

    pub async fn rpc_response_received(&self, request: &RpcMessage, error: bool) {
        self.record(&request.api_name, RPC_RESPONSE_RECEIVED, || {
            let mut kwargs = self.rpc_kwargs(request);
            kwargs.insert("error".to_string(), json!(error));
            kwargs
        })
        .await
    }

    pub async fn event_fired(&self, event: &EventMessage) {
        self.record(&event.api_name, EVENT_FIRED, || self.event_kwargs(event))
            .await
    }

    pub async fn event_received(&self, event: &EventMessage) {
        self.record(&event.api_name, EVENT_RECEIVED, || self.event_kwargs(event))
            .await
    }

    async fn record(&self, api: &str, name: &str, kwargs: impl FnOnce() -> Kwargs) {
        if !self.enabled || api.starts_with(INTERNAL_PREFIX) {
            return;
        }
        let event = EventMessage::new(METRICS_API, name, kwargs());
        if let Err(e) = self.transport.send_event(&event).await {
            warn!(metric = %name, error = %e, "Failed to publish metrics event");
        }
    }

    fn rpc_kwargs(&self, request: &RpcMessage) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("process_name".to_string(), json!(self.process_name));
        kwargs.insert("id".to_string(), json!(request.id));
        kwargs.insert("api_name".to_string(), json!(request.api_name));
        kwargs.insert("procedure_name".to_string(), json!(request.procedure_name));
        kwargs
    }

    fn event_kwargs(&self, event: &EventMessage) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("process_name".to_string(), json!(self.process_name));
        kwargs.insert("id".to_string(), json!(event.id));
        kwargs.insert("api_name".to_string(), json!(event.api_name));
        kwargs.insert("event_name".to_string(), json!(event.event_name));
        kwargs
    }
}
