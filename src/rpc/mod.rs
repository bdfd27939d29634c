//! RPC engine.
//!
//! Outbound: `call` validates, registers a pending call, sends the request and
//! waits for exactly one outcome (result, remote error, timeout or shutdown).
//!
//! Inbound: `handle_inbound` runs the local handler for a request and sends a
//! single result back on the caller's return path. Handler errors and panics
//! become error results; they never reach the run loop.

mod pending;

pub use pending::{Outcome, PendingCall, PendingCalls};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, trace, warn};

use crate::api::{validate_api_name, validate_name};
use crate::config::Config;
use crate::error::{error_chain, BusError, Result};
use crate::message::{Kwargs, ResultMessage, RpcMessage};
use crate::metrics::MetricsRecorder;
use crate::registry::ApiRegistry;
use crate::transport::TransportAdapter;

pub struct RpcEngine {
    transport: Arc<TransportAdapter>,
    registry: Arc<RwLock<ApiRegistry>>,
    pending: Arc<PendingCalls>,
    metrics: MetricsRecorder,
    config: Arc<Config>,
}

impl RpcEngine {
    pub fn new(
        transport: Arc<TransportAdapter>,
        registry: Arc<RwLock<ApiRegistry>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            metrics: MetricsRecorder::new(transport.clone(), &config),
            transport,
            registry,
            pending: Arc::new(PendingCalls::new()),
            config,
        }
    }

    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    /// Call a remote procedure and wait for its result.
    ///
    /// `timeout` defaults to the API's configured timeout. On timeout the
    /// request may still execute on the serving side.
    #[tracing::instrument(name = "bus.call", skip_all, fields(api = %api, method = %method))]
    pub async fn call(
        &self,
        api: &str,
        method: &str,
        kwargs: Kwargs,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        validate_api_name(api)?;
        validate_name(method)?;
        {
            let registry = self.registry.read().await;
            match registry.try_resolve(api) {
                Some(schema) => schema.check_call(method, &kwargs)?,
                None if self.config.validation.strict => {
                    return Err(BusError::ApiNotFound(api.to_string()))
                }
                None => {}
            }
        }

        let timeout = timeout.unwrap_or_else(|| self.config.rpc_timeout(api));
        let request = RpcMessage::new(
            api,
            method,
            kwargs,
            self.transport.return_path(),
            &self.config.process_name,
        );
        let correlation_id = request.id.clone();
        let mut outcome = self
            .pending
            .insert(&correlation_id, api, method, timeout)
            .await;

        if let Err(e) = self.transport.send_request(&request).await {
            self.pending.take(&correlation_id).await;
            return Err(e);
        }
        self.metrics.rpc_call_sent(&request).await;

        match tokio::time::timeout(timeout, &mut outcome).await {
            Ok(Ok(result)) => {
                self.metrics
                    .rpc_response_received(&request, result.is_err())
                    .await;
                result
            }
            Ok(Err(_)) => Err(BusError::Shutdown),
            Err(_) => match self.pending.take(&correlation_id).await {
                Some(call) => {
                    warn!(
                        correlation_id = %correlation_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "RPC call timed out"
                    );
                    Err(BusError::RpcTimeout {
                        api: call.api,
                        method: call.method,
                        timeout,
                    })
                }
                // Resolved concurrently; the outcome is already on its way.
                None => outcome.await.unwrap_or(Err(BusError::Shutdown)),
            },
        }
    }

    /// Execute an inbound request and send its result.
    ///
    /// Returns `MethodNotFound`/`ApiNotFound` without sending anything when the
    /// method is not served here, and transport errors when the result could
    /// not be sent.
    #[tracing::instrument(
        name = "bus.rpc.handle",
        skip_all,
        fields(correlation_id = %request.id, api = %request.api_name, method = %request.procedure_name)
    )]
    pub async fn handle_inbound(&self, request: &RpcMessage) -> Result<()> {
        let (handler, schema_check) = {
            let registry = self.registry.read().await;
            let api = registry.local(&request.api_name)?;
            let handler = registry.handler(&request.api_name, &request.procedure_name)?;
            let check = api
                .schema()
                .check_call(&request.procedure_name, &request.kwargs);
            (handler, check)
        };
        self.metrics.rpc_call_received(request).await;
        trace!(kwargs = ?request.kwargs, "Handling RPC request");

        let started = Instant::now();
        let result = match schema_check {
            Err(e) => {
                warn!(error = %e, "Rejecting RPC request with invalid parameters");
                ResultMessage::failure(&request.id, e.to_string(), error_chain(&e))
            }
            Ok(()) => {
                let kwargs = request.kwargs.clone();
                let call = AssertUnwindSafe(async move { handler.call(kwargs).await });
                match call.catch_unwind().await {
                    Ok(Ok(value)) => ResultMessage::success(&request.id, value),
                    Ok(Err(e)) => {
                        warn!(error = %e, "RPC handler returned an error");
                        ResultMessage::failure(&request.id, e.to_string(), error_chain(e.as_ref()))
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(panic = %message, "RPC handler panicked");
                        ResultMessage::failure(
                            &request.id,
                            format!("handler panicked: {}", message),
                            message,
                        )
                    }
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.transport.send_result(request, &result).await?;
        self.metrics.rpc_response_sent(request, &result).await;
        info!(
            elapsed_ms,
            error = result.error,
            rpc = %request.canonical_name(),
            "Served RPC"
        );
        Ok(())
    }

    /// Hand an arriving result to its waiting caller.
    pub async fn resolve_result(&self, result: ResultMessage) -> bool {
        self.pending.resolve(result).await
    }

    /// Expire overdue pending calls.
    pub async fn sweep(&self) -> usize {
        self.pending.sweep(tokio::time::Instant::now()).await
    }

    /// Fail every pending call with `Shutdown`.
    pub async fn fail_pending(&self) -> usize {
        self.pending.fail_all().await
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
