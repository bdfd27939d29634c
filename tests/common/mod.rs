//! Shared utilities for bus integration tests.
//!
//! A [`Harness`] creates buses over one broker with test timings, so the same
//! scenarios run against every broker implementation.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use relaybus::{Api, ApiSchema, Broker, Bus, Config, EventListener, EventMessage, HandlerError, Kwargs};

/// Buses sharing one broker and key prefix.
pub struct Harness {
    broker: Arc<dyn Broker>,
    key_prefix: String,
}

impl Harness {
    pub fn new(broker: Arc<dyn Broker>, key_prefix: impl Into<String>) -> Self {
        Self {
            broker,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Test configuration for one process of a service.
    pub fn config(&self, service: &str, process: &str) -> Config {
        let mut config = Config::for_test();
        config.service_name = service.to_string();
        config.process_name = process.to_string();
        config.transport.redis.key_prefix = self.key_prefix.clone();
        config.state.enabled = false;
        config
    }

    pub fn bus(&self, service: &str, process: &str) -> Bus {
        self.bus_with(self.config(service, process))
    }

    pub fn bus_with(&self, config: Config) -> Bus {
        Bus::new(config, self.broker.clone())
    }

    pub fn stream(&self, name: &str) -> String {
        format!("{}:{}", self.key_prefix, name)
    }
}

/// Unique key prefix per test run.
pub fn unique_prefix() -> String {
    format!("test_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

pub fn kwargs(pairs: &[(&str, Value)]) -> Kwargs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn admin_credentials() -> Kwargs {
    kwargs(&[("user", json!("admin")), ("password", json!("secret"))])
}

pub fn bob_registered() -> Kwargs {
    kwargs(&[("username", json!("bob")), ("email", json!("bob@x.com"))])
}

/// The `auth` API: `check_password(user, password)`, `explode(reason)`,
/// `slow(ms)` and event `user_registered(username, email)`.
pub fn auth_api() -> Api {
    Api::builder("auth")
        .method("check_password", ["user", "password"], |kwargs: Kwargs| async move {
            Ok::<_, HandlerError>(json!(
                kwargs["user"] == "admin" && kwargs["password"] == "secret"
            ))
        })
        .method("explode", ["reason"], |kwargs: Kwargs| async move {
            let reason = kwargs["reason"].as_str().unwrap_or("no reason").to_string();
            Err::<Value, HandlerError>(reason.into())
        })
        .method("slow", ["ms"], |kwargs: Kwargs| async move {
            let ms = kwargs["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, HandlerError>(json!(ms))
        })
        .event("user_registered", ["username", "email"])
        .build()
        .expect("auth api is valid")
}

pub fn auth_schema() -> ApiSchema {
    auth_api().schema().clone()
}

/// Shared, ordered log of `(listener, event)` invocations.
pub type DeliveryLog = Arc<Mutex<Vec<(String, Arc<EventMessage>)>>>;

pub struct RecordingListener {
    name: String,
    log: DeliveryLog,
}

impl RecordingListener {
    pub fn new(name: &str, log: &DeliveryLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
        })
    }
}

impl EventListener for RecordingListener {
    fn handle(&self, event: Arc<EventMessage>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.log
            .lock()
            .expect("log lock")
            .push((self.name.clone(), event));
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
pub struct CountingListener {
    count: AtomicUsize,
}

impl CountingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl EventListener for CountingListener {
    fn handle(&self, _event: Arc<EventMessage>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Fails every event, or panics when `panics` is set.
pub struct FailingListener {
    pub panics: bool,
}

impl EventListener for FailingListener {
    fn handle(&self, _event: Arc<EventMessage>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let panics = self.panics;
        Box::pin(async move {
            if panics {
                panic!("listener blew up");
            }
            Err::<(), HandlerError>("listener failed".into())
        })
    }
}

/// Poll `check` until it returns true or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
