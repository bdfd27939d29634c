//! Event engine.
//!
//! Publishing appends to the event's stream and returns without waiting for
//! listeners. Delivery runs every listener registered for the event's
//! `(api, event)` key in registration order; a failing or panicking listener
//! is logged and does not stop the ones after it.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::api::{validate_api_name, validate_name};
use crate::config::Config;
use crate::error::{error_chain, BusError, HandlerError, Result};
use crate::message::{EventMessage, Kwargs, Position};
use crate::metrics::MetricsRecorder;
use crate::registry::ApiRegistry;
use crate::rpc::panic_message;
use crate::transport::TransportAdapter;

/// Listener for one or more events.
pub trait EventListener: Send + Sync {
    fn handle(&self, event: Arc<EventMessage>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> EventListener for F
where
    F: Fn(Arc<EventMessage>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        event: Arc<EventMessage>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(event))
    }
}

/// `(api_name, event_name)`.
pub type EventKey = (String, String);

struct Registration {
    name: String,
    listener: Arc<dyn EventListener>,
}

#[derive(Default)]
struct ListenerTable {
    started: bool,
    by_key: BTreeMap<EventKey, Vec<Registration>>,
}

/// Outcome of delivering one event to its local listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub listeners: usize,
    pub failures: usize,
}

pub struct EventEngine {
    transport: Arc<TransportAdapter>,
    registry: Arc<RwLock<ApiRegistry>>,
    config: Arc<Config>,
    metrics: MetricsRecorder,
    listeners: RwLock<ListenerTable>,
}

impl EventEngine {
    pub fn new(
        transport: Arc<TransportAdapter>,
        registry: Arc<RwLock<ApiRegistry>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            metrics: MetricsRecorder::new(transport.clone(), &config),
            transport,
            registry,
            config,
            listeners: RwLock::new(ListenerTable::default()),
        }
    }

    /// Publish an event declared on a locally served API.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(api = %api, event = %event))]
    pub async fn publish(&self, api: &str, event: &str, kwargs: Kwargs) -> Result<Position> {
        {
            let registry = self.registry.read().await;
            let local = registry.local(api)?;
            local.schema().check_event(event, &kwargs)?;
        }
        let message = EventMessage::new(api, event, kwargs);
        let position = self.transport.send_event(&message).await?;
        self.metrics.event_fired(&message).await;
        Ok(position)
    }

    /// Register a listener. Only allowed before delivery starts.
    pub async fn listen(
        &self,
        api: &str,
        event: &str,
        name: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        validate_api_name(api)?;
        validate_name(event)?;
        {
            let registry = self.registry.read().await;
            match registry.try_resolve(api) {
                Some(schema) if schema.get_event(event).is_none() => {
                    return Err(BusError::UnknownEvent {
                        api: api.to_string(),
                        event: event.to_string(),
                    })
                }
                Some(_) => {}
                None if self.config.validation.strict => {
                    return Err(BusError::ApiNotFound(api.to_string()))
                }
                None => {}
            }
        }

        let mut table = self.listeners.write().await;
        if table.started {
            return Err(BusError::ListenAfterStart {
                api: api.to_string(),
                event: event.to_string(),
            });
        }
        table
            .by_key
            .entry((api.to_string(), event.to_string()))
            .or_default()
            .push(Registration {
                name: name.to_string(),
                listener,
            });
        debug!(api = %api, event = %event, listener = %name, "Registered event listener");
        Ok(())
    }

    /// Close registration and return the keys to consume.
    pub async fn begin_delivery(&self) -> Vec<EventKey> {
        let mut table = self.listeners.write().await;
        table.started = true;
        table.by_key.keys().cloned().collect()
    }

    pub async fn keys(&self) -> Vec<EventKey> {
        self.listeners.read().await.by_key.keys().cloned().collect()
    }

    pub async fn has_started(&self) -> bool {
        self.listeners.read().await.started
    }

    /// Run every listener for the event, in registration order.
    #[tracing::instrument(
        name = "bus.event.deliver",
        skip_all,
        fields(api = %event.api_name, event = %event.event_name)
    )]
    pub async fn deliver(&self, event: Arc<EventMessage>) -> DeliveryReport {
        let listeners: Vec<(String, Arc<dyn EventListener>)> = {
            let table = self.listeners.read().await;
            table
                .by_key
                .get(&(event.api_name.clone(), event.event_name.clone()))
                .map(|regs| {
                    regs.iter()
                        .map(|r| (r.name.clone(), r.listener.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        self.metrics.event_received(&event).await;

        let mut report = DeliveryReport {
            listeners: listeners.len(),
            failures: 0,
        };
        for (name, listener) in listeners {
            let event = event.clone();
            let run = AssertUnwindSafe(async move { listener.handle(event).await });
            match run.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failures += 1;
                    error!(listener = %name, error = %error_chain(e.as_ref()), "Event listener failed");
                }
                Err(panic) => {
                    report.failures += 1;
                    error!(listener = %name, panic = %panic_message(panic.as_ref()), "Event listener panicked");
                }
            }
        }
        debug!(
            position = ?event.position,
            listeners = report.listeners,
            failures = report.failures,
            "Delivered event"
        );
        report
    }
}
