//! Outbound calls awaiting their result.
//!
//! An entry leaves the map exactly once: taken by the result listener when
//! the result arrives, by the sweeper or the waiting caller when the deadline
//! passes, or by shutdown. Whoever removes it owns the single outcome.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::message::ResultMessage;

/// Receives the outcome of a pending call.
pub type Outcome = oneshot::Receiver<Result<Value>>;

#[derive(Debug)]
pub struct PendingCall {
    pub api: String,
    pub method: String,
    pub deadline: Instant,
    pub timeout: Duration,
    sender: oneshot::Sender<Result<Value>>,
}

impl PendingCall {
    /// Deliver the outcome. Returns false if the caller stopped waiting.
    pub fn complete(self, outcome: Result<Value>) -> bool {
        self.sender.send(outcome).is_ok()
    }

    fn timed_out(self) -> bool {
        let error = BusError::RpcTimeout {
            api: self.api.clone(),
            method: self.method.clone(),
            timeout: self.timeout,
        };
        self.complete(Err(error))
    }
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a call until `timeout` from now.
    pub async fn insert(
        &self,
        correlation_id: &str,
        api: &str,
        method: &str,
        timeout: Duration,
    ) -> Outcome {
        let (sender, receiver) = oneshot::channel();
        let call = PendingCall {
            api: api.to_string(),
            method: method.to_string(),
            deadline: Instant::now() + timeout,
            timeout,
            sender,
        };
        self.calls
            .lock()
            .await
            .insert(correlation_id.to_string(), call);
        receiver
    }

    pub async fn take(&self, correlation_id: &str) -> Option<PendingCall> {
        self.calls.lock().await.remove(correlation_id)
    }

    /// Complete the call a result belongs to.
    ///
    /// Returns false when no call is waiting for it (it already timed out or
    /// was never issued by this process); the result is then discarded.
    pub async fn resolve(&self, result: ResultMessage) -> bool {
        let Some(call) = self.take(&result.rpc_id).await else {
            warn!(
                correlation_id = %result.rpc_id,
                "Discarding RPC result with no pending call (late or unknown)"
            );
            return false;
        };

        let outcome = if result.error {
            Err(BusError::Remote {
                api: call.api.clone(),
                method: call.method.clone(),
                message: result.error_message(),
                trace: result.trace,
            })
        } else {
            Ok(result.result)
        };
        if !call.complete(outcome) {
            debug!(correlation_id = %result.rpc_id, "Caller stopped waiting for RPC result");
        }
        true
    }

    /// Expire every call whose deadline is at or before `now`.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingCall> = {
            let mut calls = self.calls.lock().await;
            let ids: Vec<String> = calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };
        let count = expired.len();
        for call in expired {
            debug!(api = %call.api, method = %call.method, "Pending call expired");
            call.timed_out();
        }
        count
    }

    /// Fail every pending call with `Shutdown`.
    pub async fn fail_all(&self) -> usize {
        let calls: Vec<PendingCall> = self.calls.lock().await.drain().map(|(_, c)| c).collect();
        let count = calls.len();
        for call in calls {
            call.complete(Err(BusError::Shutdown));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.calls.lock().await.is_empty()
    }
}
