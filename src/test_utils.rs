//! Test helpers: the `auth` example API and recording listeners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::api::{Api, ApiSchema};
use crate::broker::MemoryBroker;
use crate::bus::Bus;
use crate::config::Config;
use crate::error::HandlerError;
use crate::events::EventListener;
use crate::message::{EventMessage, Kwargs};

/// The `auth` API used throughout the tests.
///
/// - `check_password(user, password)`: true for admin/secret
/// - `explode(reason)`: returns an error carrying `reason`
/// - `panic()`: panics
/// - `slow(ms)`: sleeps `ms` milliseconds, returns `ms`
/// - event `user_registered(username, email)`
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
        .method("panic", Vec::<String>::new(), |_: Kwargs| async move { blow_up() })
        .method("slow", ["ms"], |kwargs: Kwargs| async move {
            let ms = kwargs["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, HandlerError>(json!(ms))
        })
        .event("user_registered", ["username", "email"])
        .build()
        .expect("auth api is valid")
}

fn blow_up() -> Result<Value, HandlerError> {
    panic!("handler blew up")
}

/// Schema of [`auth_api`], for processes that only call it.
pub fn auth_schema() -> ApiSchema {
    auth_api().schema().clone()
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

/// Test configuration for one process of a service.
pub fn test_config(service: &str, process: &str) -> Config {
    let mut config = Config::for_test();
    config.service_name = service.to_string();
    config.process_name = process.to_string();
    config.state.enabled = false;
    config
}

/// A bus over a shared memory broker.
pub fn memory_bus(broker: &Arc<MemoryBroker>, service: &str, process: &str) -> Bus {
    Bus::new(test_config(service, process), broker.clone())
}

/// Shared, ordered log of `(listener, event)` invocations.
pub type DeliveryLog = Arc<Mutex<Vec<(String, Arc<EventMessage>)>>>;

/// Appends every event it receives to a shared log.
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
        if let Ok(mut log) = self.log.lock() {
            log.push((self.name.clone(), event));
        }
        Box::pin(async { Ok::<(), HandlerError>(()) })
    }
}

/// Counts invocations.
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
        Box::pin(async { Ok::<(), HandlerError>(()) })
    }
}

/// Always fails, or panics when `panics` is set.
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

/// Formatted log output collected while a [`CapturedLogs::install`] guard is held.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Capture `INFO` and above on the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || logs.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
