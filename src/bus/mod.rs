//! Bus coordinator.
//!
//! One [`Bus`] per process. It owns the registry and both engines, and while
//! running it supervises these tasks:
//!
//! - two intake tasks (RPC requests and events) that pull batches from the
//!   transport and feed a bounded channel
//! - a dispatcher that runs each unit on a worker pool bounded by
//!   `dispatch.max_concurrency`
//! - a result listener resolving outbound calls, outside the worker pool so a
//!   handler may call other APIs without starving its own results
//! - a sweeper expiring overdue pending calls
//! - with `schema.share`, a monitor that refreshes this process's schemas in
//!   the broker and learns the schemas of others
//!
//! When every worker is busy the dispatcher stops receiving, the channel
//! fills and intake stops reading from the transport.
//!
//! ```text
//! Created ──start──► Starting ──► Running ──shutdown──► Stopping ──► Stopped
//!    │                  │                                               ▲
//!    │                  └──────────── transport unreachable ────────────┤
//!    └───────────────────────────── shutdown ───────────────────────────┘
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{Api, ApiSchema};
use crate::broker::{init_broker, Broker, ReadFrom, StartFrom};
use crate::config::{Config, ReconnectConfig, SchemaConfig};
use crate::error::{BusError, Result};
use crate::events::{EventEngine, EventListener};
use crate::message::{EventMessage, Kwargs, Position, RpcMessage};
use crate::metrics;
use crate::registry::ApiRegistry;
use crate::rpc::RpcEngine;
use crate::state::{self, STATE_API};
use crate::transport::{Inbound, TransportAdapter};
use crate::utils::retry::{next_delay, reconnect_backoff, retry_startup};

/// Lifecycle of a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusState::Created => "created",
            BusState::Starting => "starting",
            BusState::Running => "running",
            BusState::Stopping => "stopping",
            BusState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The bus coordinator of one process.
///
/// Cheap to clone; clones share the same coordinator. Declare APIs and
/// listeners while `Created`, then [`start`](Bus::start). Calls and
/// publishes are accepted while `Running` or `Stopping`.
///
/// Dropping every clone without calling [`shutdown`](Bus::shutdown) leaves the
/// background tasks running until the runtime exits.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: Arc<Config>,
    transport: Arc<TransportAdapter>,
    registry: Arc<RwLock<ApiRegistry>>,
    rpc: Arc<RpcEngine>,
    events: Arc<EventEngine>,
    state: watch::Sender<BusState>,
    runtime: Mutex<Option<Runtime>>,
}

/// Handles to the tasks spawned by `start`.
struct Runtime {
    intake_stop: watch::Sender<bool>,
    dispatch_stop: watch::Sender<bool>,
    service_stop: watch::Sender<bool>,
    intake: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
    services: Vec<JoinHandle<()>>,
}

impl Bus {
    /// Create a bus over an existing broker.
    pub fn new(config: Config, broker: Arc<dyn Broker>) -> Self {
        let config = Arc::new(config);
        let transport = Arc::new(TransportAdapter::new(broker, &config));
        let registry = Arc::new(RwLock::new(ApiRegistry::new()));
        let rpc = Arc::new(RpcEngine::new(
            transport.clone(),
            registry.clone(),
            config.clone(),
        ));
        let events = Arc::new(EventEngine::new(
            transport.clone(),
            registry.clone(),
            config.clone(),
        ));
        let (state, _) = watch::channel(BusState::Created);

        Self {
            inner: Arc::new(BusInner {
                config,
                transport,
                registry,
                rpc,
                events,
                state,
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Create a bus over the broker selected by `config.transport`.
    ///
    /// Connecting is retried within the startup window. With `schema.share`
    /// the schemas other processes shared are loaded, so listeners for their
    /// events can be validated before `start`.
    pub async fn connect(config: Config) -> Result<Self> {
        validate(&config)?;
        let transport = &config.transport;
        let broker = retry_startup(&config.startup, "connect", move || init_broker(transport))
            .await
            .map_err(|e| {
                BusError::TransportUnavailable(format!(
                    "no connection after {} retries: {}",
                    config.startup.connect_attempts, e
                ))
            })?;
        let bus = Self::new(config, broker);
        if bus.config().schema.share {
            match bus.load_remote_schemas().await {
                Ok(learned) => debug!(learned, "Loaded shared API schemas"),
                Err(e) => warn!(error = %e, "Failed to load shared API schemas"),
            }
        }
        Ok(bus)
    }

    pub fn state(&self) -> BusState {
        *self.inner.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<BusState> {
        self.inner.state.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    pub fn process_name(&self) -> &str {
        &self.inner.config.process_name
    }

    /// Number of outbound calls awaiting a result.
    pub async fn pending_calls(&self) -> usize {
        self.inner.rpc.pending().len().await
    }

    // ------------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------------

    /// Serve an API from this process.
    pub async fn register_api(&self, api: Api) -> Result<()> {
        self.require_state(&[BusState::Created])?;
        self.inner.registry.write().await.register(api)?;
        Ok(())
    }

    /// Declare an API served elsewhere so calls and listeners are validated
    /// locally.
    pub async fn declare_remote(&self, schema: ApiSchema) -> Result<()> {
        self.require_state(&[BusState::Created])?;
        self.inner.registry.write().await.declare_remote(schema)
    }

    /// Learn the schemas other processes shared through the broker.
    ///
    /// Returns how many schemas were new or changed. Explicitly declared and
    /// locally served APIs take precedence over shared ones.
    pub async fn load_remote_schemas(&self) -> Result<usize> {
        let schemas = self.inner.transport.load_schemas().await?;
        let mut registry = self.inner.registry.write().await;
        Ok(schemas
            .into_iter()
            .map(|schema| registry.learn_shared(schema))
            .filter(|learned| *learned)
            .count())
    }

    /// Attach a listener for `api.event`.
    ///
    /// Fails with `ListenAfterStart` once the bus has left `Created`.
    pub async fn listen(
        &self,
        api: &str,
        event: &str,
        name: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        if self.state() != BusState::Created {
            return Err(BusError::ListenAfterStart {
                api: api.to_string(),
                event: event.to_string(),
            });
        }
        self.inner.events.listen(api, event, name, listener).await
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Call `api.method` with the API's default timeout.
    pub async fn call(&self, api: &str, method: &str, kwargs: Kwargs) -> Result<Value> {
        self.require_state(&[BusState::Running, BusState::Stopping])?;
        self.inner.rpc.call(api, method, kwargs, None).await
    }

    pub async fn call_with_timeout(
        &self,
        api: &str,
        method: &str,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> Result<Value> {
        self.require_state(&[BusState::Running, BusState::Stopping])?;
        self.inner.rpc.call(api, method, kwargs, Some(timeout)).await
    }

    /// Publish an event of a locally served API.
    pub async fn publish(&self, api: &str, event: &str, kwargs: Kwargs) -> Result<Position> {
        self.require_state(&[BusState::Running, BusState::Stopping])?;
        self.inner.events.publish(api, event, kwargs).await
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect, join consumer groups and start the run loop.
    ///
    /// If the transport stays unreachable for the whole startup window the
    /// bus ends up `Stopped` and `TransportUnavailable` is returned.
    pub async fn start(&self) -> Result<()> {
        self.transition(&[BusState::Created], BusState::Starting)?;
        info!(
            service = %self.service_name(),
            process = %self.process_name(),
            "Bus starting"
        );

        let runtime = match self.launch().await {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Bus failed to start");
                self.force_state(BusState::Stopped);
                return Err(e);
            }
        };
        *self.inner.runtime.lock().await = Some(runtime);
        self.transition(&[BusState::Starting], BusState::Running)?;
        self.announce_started().await;
        Ok(())
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await
    }

    /// Stop pulling work, let in-flight work finish within the grace period
    /// and fail whatever is still pending with `Shutdown`.
    ///
    /// Idempotent. A concurrent caller waits for the first one to finish.
    /// Runs on its own task, so a handler may shut down its own bus: the
    /// handler is cancelled at the end of the grace period, the shutdown
    /// still completes.
    pub async fn shutdown(&self) -> Result<()> {
        let bus = self.clone();
        match tokio::spawn(async move { bus.stop().await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Shutdown task failed");
                Err(BusError::Shutdown)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        match self.state() {
            BusState::Created => {
                if self.transition(&[BusState::Created], BusState::Stopped).is_ok() {
                    info!("Bus stopped before starting");
                    return Ok(());
                }
            }
            BusState::Starting => return Err(BusError::InvalidState(BusState::Starting)),
            BusState::Stopped => return Ok(()),
            BusState::Running | BusState::Stopping => {}
        }
        if self
            .transition(&[BusState::Running], BusState::Stopping)
            .is_err()
        {
            return self.wait_stopped().await;
        }

        let started = Instant::now();
        let grace = self.inner.config.shutdown.grace_period();
        let deadline = started + grace;
        info!(grace_ms = grace.as_millis() as u64, "Bus stopping");
        self.announce_stopped().await;

        let runtime = self.inner.runtime.lock().await.take();
        if let Some(runtime) = runtime {
            let _ = runtime.intake_stop.send(true);
            for handle in runtime.intake {
                report_exit("intake", handle.await);
            }

            let _ = runtime.dispatch_stop.send(true);
            report_exit("dispatcher", runtime.dispatcher.await);

            // Results for outstanding calls keep arriving until the deadline.
            while !self.inner.rpc.pending().is_empty().await && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let failed = self.inner.rpc.fail_pending().await;
            if failed > 0 {
                warn!(failed, "Failed pending RPC calls on shutdown");
            }

            let _ = runtime.service_stop.send(true);
            for handle in runtime.services {
                report_exit("service", handle.await);
            }
        }

        self.force_state(BusState::Stopped);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Bus stopped"
        );
        Ok(())
    }

    async fn launch(&self) -> Result<Runtime> {
        let inner = &self.inner;
        let config = &inner.config;
        validate(config)?;
        self.wait_for_transport().await?;

        {
            let mut registry = inner.registry.write().await;
            if config.state.enabled {
                registry.register(state::state_api()?)?;
            }
            if config.metrics.enabled {
                registry.register(metrics::metrics_api()?)?;
            }
        }

        if config.schema.share {
            let learned = self.load_remote_schemas().await?;
            share_local_schemas(&inner.transport, &inner.registry, config.schema.ttl()).await?;
            info!(learned, "Shared API schemas exchanged");
        }

        let keys = inner.events.begin_delivery().await;
        let served: Vec<String> = if !config.rpc.serve {
            info!("Not serving RPCs; events only");
            Vec::new()
        } else {
            let registry = inner.registry.read().await;
            registry
                .local_names()
                .into_iter()
                .filter(|name| {
                    registry
                        .local(name)
                        .map(|api| !api.schema().methods.is_empty())
                        .unwrap_or(false)
                })
                .collect()
        };
        let rpc_streams = inner.transport.rpc_streams(&served);
        let event_streams = inner.transport.event_streams(&keys);
        let requests_in_flight = Arc::new(InFlight::default());
        let events_in_flight = Arc::new(InFlight::default());
        let requests = Lane::Requests;
        let events = Lane::Events(config.events.start_from);
        requests.prepare(&inner.transport, &rpc_streams).await?;
        events.prepare(&inner.transport, &event_streams).await?;

        let (tx, rx) = mpsc::channel(config.dispatch.intake_buffer);
        let (intake_stop, _) = watch::channel(false);
        let (dispatch_stop, _) = watch::channel(false);
        let (service_stop, _) = watch::channel(false);

        let intake = vec![
            tokio::spawn(run_intake(
                requests,
                inner.transport.clone(),
                rpc_streams,
                requests_in_flight.clone(),
                config.reconnect.clone(),
                tx.clone(),
                intake_stop.subscribe(),
            )),
            tokio::spawn(run_intake(
                events,
                inner.transport.clone(),
                event_streams,
                events_in_flight.clone(),
                config.reconnect.clone(),
                tx,
                intake_stop.subscribe(),
            )),
        ];

        let workers = Workers {
            transport: inner.transport.clone(),
            rpc: inner.rpc.clone(),
            events: inner.events.clone(),
            requests_in_flight,
            events_in_flight,
        };
        let dispatcher = tokio::spawn(run_dispatcher(
            workers,
            rx,
            config.dispatch.max_concurrency,
            config.shutdown.grace_period(),
            dispatch_stop.subscribe(),
        ));

        let mut services = vec![
            tokio::spawn(run_result_listener(
                inner.transport.clone(),
                inner.rpc.clone(),
                config.reconnect.clone(),
                service_stop.subscribe(),
            )),
            tokio::spawn(run_sweeper(
                inner.rpc.clone(),
                Duration::from_millis(config.rpc.sweep_interval_ms.max(1)),
                service_stop.subscribe(),
            )),
        ];
        if config.schema.share {
            services.push(tokio::spawn(run_schema_monitor(
                inner.transport.clone(),
                inner.registry.clone(),
                config.schema.clone(),
                service_stop.subscribe(),
            )));
        }

        let api_names = inner.registry.read().await.local_names();
        info!(
            apis = ?api_names,
            served = served.len(),
            listening_for = keys.len(),
            max_concurrency = config.dispatch.max_concurrency,
            "Bus running"
        );

        Ok(Runtime {
            intake_stop,
            dispatch_stop,
            service_stop,
            intake,
            dispatcher,
            services,
        })
    }

    /// Ping the transport until it answers or the startup window closes.
    async fn wait_for_transport(&self) -> Result<()> {
        let startup = &self.inner.config.startup;
        let transport = &self.inner.transport;
        retry_startup(startup, "ping", move || transport.ping())
            .await
            .map_err(|e| {
                BusError::TransportUnavailable(format!(
                    "no answer after {} retries: {}",
                    startup.connect_attempts, e
                ))
            })
    }

    async fn announce_started(&self) {
        if !self.inner.config.state.enabled {
            return;
        }
        let api_names = self.inner.registry.read().await.local_names();
        let keys = self.inner.events.keys().await;
        let kwargs =
            state::server_started(self.service_name(), self.process_name(), &api_names, &keys);
        if let Err(e) = self
            .inner
            .events
            .publish(STATE_API, state::SERVER_STARTED, kwargs)
            .await
        {
            warn!(error = %e, "Failed to announce server start");
        }
    }

    async fn announce_stopped(&self) {
        if !self.inner.config.state.enabled {
            return;
        }
        let kwargs = state::server_stopped(self.service_name(), self.process_name());
        if let Err(e) = self
            .inner
            .events
            .publish(STATE_API, state::SERVER_STOPPED, kwargs)
            .await
        {
            warn!(error = %e, "Failed to announce server stop");
        }
    }

    async fn wait_stopped(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        state
            .wait_for(|s| *s == BusState::Stopped)
            .await
            .map(|_| ())
            .map_err(|_| BusError::Shutdown)
    }

    fn require_state(&self, allowed: &[BusState]) -> Result<()> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(BusError::InvalidState(current))
        }
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[BusState], to: BusState) -> Result<()> {
        let mut rejected = None;
        self.inner.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            Some(current) => Err(BusError::InvalidState(current)),
            None => {
                debug!(state = %to, "Bus state changed");
                Ok(())
            }
        }
    }

    fn force_state(&self, to: BusState) {
        self.inner.state.send_replace(to);
        debug!(state = %to, "Bus state changed");
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("service_name", &self.service_name())
            .field("process_name", &self.process_name())
            .field("state", &self.state())
            .finish()
    }
}

fn validate(config: &Config) -> Result<()> {
    config
        .validate()
        .map_err(|e| BusError::InvalidConfig(e.to_string()))
}

fn report_exit(task: &str, outcome: std::result::Result<(), JoinError>) {
    if let Err(e) = outcome {
        if e.is_panic() {
            error!(task, "Bus task panicked");
        }
    }
}

// ============================================================================
// Intake
// ============================================================================

/// A unit of inbound work.
enum WorkUnit {
    Request(Inbound<RpcMessage>),
    Event(Inbound<EventMessage>),
}

/// `(stream, position)` of a consumer group entry.
type EntryKey = (String, Position);

impl WorkUnit {
    fn key(&self) -> EntryKey {
        match self {
            WorkUnit::Request(inbound) => (inbound.stream.clone(), inbound.position),
            WorkUnit::Event(inbound) => (inbound.stream.clone(), inbound.position),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Tracked {
    /// Handed to the dispatcher, not yet settled.
    queued: HashSet<EntryKey>,
    /// Ran to completion, but the ack failed.
    unacked: HashSet<EntryKey>,
}

/// Entries of one lane that this process read and has not acknowledged.
///
/// Recovery re-reads the consumer's own pending entries. Those still queued
/// or running are skipped, those whose ack failed are acknowledged without
/// running them again, the rest were lost on the way and are dispatched.
#[derive(Default)]
struct InFlight {
    tracked: Mutex<Tracked>,
    recover: AtomicBool,
}

impl InFlight {
    async fn track(&self, key: EntryKey) {
        self.tracked.lock().await.queued.insert(key);
    }

    async fn settle(&self, key: &EntryKey) {
        self.tracked.lock().await.queued.remove(key);
    }

    /// The unit ran but its ack failed.
    async fn settle_unacked(&self, key: EntryKey) {
        {
            let mut tracked = self.tracked.lock().await;
            tracked.queued.remove(&key);
            tracked.unacked.insert(key);
        }
        self.recover.store(true, Ordering::SeqCst);
    }

    /// The unit did not complete; it runs again after the next recovery.
    async fn abandon(&self, key: &EntryKey) {
        self.tracked.lock().await.queued.remove(key);
        self.recover.store(true, Ordering::SeqCst);
    }

    async fn snapshot(&self) -> Tracked {
        self.tracked.lock().await.clone()
    }

    async fn forget_unacked(&self, keys: &HashSet<EntryKey>) {
        let mut tracked = self.tracked.lock().await;
        tracked.unacked.retain(|key| !keys.contains(key));
    }

    async fn is_idle(&self) -> bool {
        !self.recover.load(Ordering::SeqCst) && self.tracked.lock().await.queued.is_empty()
    }

    fn take_recovery_request(&self) -> bool {
        self.recover.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
enum Lane {
    Requests,
    Events(StartFrom),
}

impl Lane {
    fn name(self) -> &'static str {
        match self {
            Lane::Requests => "rpc",
            Lane::Events(_) => "events",
        }
    }

    /// Join the lane's consumer groups. Existing groups keep their position.
    async fn prepare(self, transport: &TransportAdapter, streams: &[String]) -> Result<()> {
        match self {
            Lane::Requests => transport.prepare_rpc_consumer(streams).await,
            Lane::Events(start) => transport.prepare_event_consumer(streams, start).await,
        }
    }

    async fn ack(self, transport: &TransportAdapter, stream: &str, position: Position) -> Result<()> {
        match self {
            Lane::Requests => transport.ack_request(stream, position).await,
            Lane::Events(_) => transport.ack_event(stream, position).await,
        }
    }

    async fn read(
        self,
        transport: &TransportAdapter,
        streams: &[String],
        from: ReadFrom,
    ) -> Result<Vec<WorkUnit>> {
        Ok(match self {
            Lane::Requests => transport
                .next_requests(streams, from)
                .await?
                .into_iter()
                .map(WorkUnit::Request)
                .collect(),
            Lane::Events(_) => transport
                .next_events(streams, from)
                .await?
                .into_iter()
                .map(WorkUnit::Event)
                .collect(),
        })
    }

    /// Work left pending by consumers that went away.
    async fn claim(self, transport: &TransportAdapter, streams: &[String]) -> Result<Vec<WorkUnit>> {
        Ok(match self {
            Lane::Requests => transport
                .claim_idle_requests(streams)
                .await?
                .into_iter()
                .map(WorkUnit::Request)
                .collect(),
            Lane::Events(_) => transport
                .claim_idle_events(streams)
                .await?
                .into_iter()
                .map(WorkUnit::Event)
                .collect(),
        })
    }

    /// Entries delivered to this consumer and not yet acknowledged.
    async fn own_pending(self, transport: &TransportAdapter, streams: &[String]) -> Result<Vec<WorkUnit>> {
        Ok(match self {
            Lane::Requests => transport
                .own_pending_requests(streams)
                .await?
                .into_iter()
                .map(WorkUnit::Request)
                .collect(),
            Lane::Events(_) => transport
                .own_pending_events(streams)
                .await?
                .into_iter()
                .map(WorkUnit::Event)
                .collect(),
        })
    }

    /// Work to pick up before reading new entries: this consumer's own
    /// pending entries that are not queued or running here, plus idle
    /// entries of other consumers.
    async fn recover(
        self,
        transport: &TransportAdapter,
        streams: &[String],
        in_flight: &InFlight,
    ) -> Result<Vec<WorkUnit>> {
        self.prepare(transport, streams).await?;
        // Taken before reading: entries settled after this point were acked first.
        let known = in_flight.snapshot().await;
        let mut units = Vec::new();
        for unit in self.own_pending(transport, streams).await? {
            let key = unit.key();
            if known.queued.contains(&key) {
                continue;
            }
            if known.unacked.contains(&key) {
                self.ack(transport, &key.0, key.1).await?;
                continue;
            }
            units.push(unit);
        }
        in_flight.forget_unacked(&known.unacked).await;
        units.extend(self.claim(transport, streams).await?);
        Ok(units)
    }
}

/// Pull batches from one lane until stopped, reconnecting with backoff.
///
/// Reads are never cancelled mid-flight; stop is checked between reads, so
/// an entry handed over by the broker always reaches the channel or stays
/// pending in its consumer group.
async fn run_intake(
    lane: Lane,
    transport: Arc<TransportAdapter>,
    streams: Vec<String>,
    in_flight: Arc<InFlight>,
    reconnect: ReconnectConfig,
    tx: mpsc::Sender<WorkUnit>,
    mut stop: watch::Receiver<bool>,
) {
    if streams.is_empty() {
        return;
    }
    let backoff_builder = reconnect_backoff(&reconnect);
    let mut backoff = backoff_builder.build();
    let mut retry_backoff = backoff_builder.build();
    let mut retrying = false;
    let mut recovering = true;
    let mut first = true;

    info!(lane = lane.name(), streams = streams.len(), "Intake started");
    while !*stop.borrow() {
        if in_flight.take_recovery_request() {
            if !recovering {
                let delay = next_delay(&mut retry_backoff, &reconnect);
                warn!(
                    lane = lane.name(),
                    backoff_ms = delay.as_millis() as u64,
                    "Unsettled work, re-reading pending entries after backoff"
                );
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                recovering = true;
                retrying = true;
            }
        } else if retrying && in_flight.is_idle().await {
            retry_backoff = backoff_builder.build();
            retrying = false;
        }

        let batch = if recovering {
            lane.recover(&transport, &streams, &in_flight).await
        } else {
            lane.read(&transport, &streams, ReadFrom::New).await
        };

        let units = match batch {
            Ok(units) => units,
            Err(e) => {
                let delay = next_delay(&mut backoff, &reconnect);
                error!(
                    lane = lane.name(),
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "Intake failed, reconnecting after backoff"
                );
                recovering = true;
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        if recovering {
            if !first || !units.is_empty() {
                info!(
                    lane = lane.name(),
                    recovered = units.len(),
                    "Intake resumed from consumer group position"
                );
            }
            backoff = backoff_builder.build();
            recovering = false;
            first = false;
        }

        for unit in units {
            in_flight.track(unit.key()).await;
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    debug!(lane = lane.name(), "Intake stopped with undispatched work; it stays pending");
                    return;
                }
                sent = tx.send(unit) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!(lane = lane.name(), "Intake stopped");
}

// ============================================================================
// Dispatch
// ============================================================================

#[derive(Clone)]
struct Workers {
    transport: Arc<TransportAdapter>,
    rpc: Arc<RpcEngine>,
    events: Arc<EventEngine>,
    requests_in_flight: Arc<InFlight>,
    events_in_flight: Arc<InFlight>,
}

impl Workers {
    async fn dispatch(&self, unit: WorkUnit) {
        match unit {
            WorkUnit::Request(inbound) => self.dispatch_request(inbound).await,
            WorkUnit::Event(inbound) => self.dispatch_event(inbound).await,
        }
    }

    async fn dispatch_request(&self, inbound: Inbound<RpcMessage>) {
        let key = (inbound.stream.clone(), inbound.position);
        match self.rpc.handle_inbound(&inbound.message).await {
            Ok(()) => {}
            Err(e) if e.is_configuration_error() => {
                // Retrying cannot help; the caller observes a timeout.
                error!(
                    correlation_id = %inbound.message.id,
                    rpc = %inbound.message.canonical_name(),
                    error = %e,
                    "Dropping RPC request this process cannot serve"
                );
            }
            Err(e) => {
                warn!(
                    correlation_id = %inbound.message.id,
                    error = %e,
                    "Failed to send RPC result, leaving request pending"
                );
                self.requests_in_flight.abandon(&key).await;
                return;
            }
        }
        match self
            .transport
            .ack_request(&inbound.stream, inbound.position)
            .await
        {
            Ok(()) => self.requests_in_flight.settle(&key).await,
            Err(e) => {
                warn!(stream = %inbound.stream, position = %inbound.position, error = %e, "Failed to ack RPC request");
                self.requests_in_flight.settle_unacked(key).await;
            }
        }
    }

    async fn dispatch_event(&self, inbound: Inbound<EventMessage>) {
        let Inbound {
            stream,
            position,
            message,
        } = inbound;
        self.events.deliver(Arc::new(message)).await;
        let key = (stream, position);
        match self.transport.ack_event(&key.0, position).await {
            Ok(()) => self.events_in_flight.settle(&key).await,
            Err(e) => {
                warn!(stream = %key.0, position = %position, error = %e, "Failed to ack event");
                self.events_in_flight.settle_unacked(key).await;
            }
        }
    }
}

async fn next_unit(
    permits: &Arc<Semaphore>,
    rx: &mut mpsc::Receiver<WorkUnit>,
) -> Option<(OwnedSemaphorePermit, WorkUnit)> {
    let permit = permits.clone().acquire_owned().await.ok()?;
    let unit = rx.recv().await?;
    Some((permit, unit))
}

fn report_worker(joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("Worker cancelled"),
        Err(e) => error!(error = %e, "Worker failed"),
    }
}

/// Run units on at most `max_concurrency` workers.
///
/// On stop, in-flight workers get `grace` to finish and are then aborted.
async fn run_dispatcher(
    workers: Workers,
    mut rx: mpsc::Receiver<WorkUnit>,
    max_concurrency: usize,
    grace: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(max_concurrency));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => report_worker(joined),
            next = next_unit(&permits, &mut rx) => {
                let Some((permit, unit)) = next else {
                    break;
                };
                let workers = workers.clone();
                tasks.spawn(async move {
                    workers.dispatch(unit).await;
                    drop(permit);
                });
            }
        }
    }
    drop(rx);

    if tasks.is_empty() {
        return;
    }
    info!(in_flight = tasks.len(), "Waiting for in-flight work");
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            report_worker(joined);
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            cancelled = tasks.len(),
            "Grace period elapsed, cancelling in-flight work"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

// ============================================================================
// Services
// ============================================================================

/// Resolve pending calls from this process's result list.
async fn run_result_listener(
    transport: Arc<TransportAdapter>,
    rpc: Arc<RpcEngine>,
    reconnect: ReconnectConfig,
    mut stop: watch::Receiver<bool>,
) {
    let backoff_builder = reconnect_backoff(&reconnect);
    let mut backoff = backoff_builder.build();
    let mut failing = false;

    while !*stop.borrow() {
        match transport.next_result().await {
            Ok(result) => {
                if failing {
                    info!("Result listener reconnected");
                    backoff = backoff_builder.build();
                    failing = false;
                }
                if let Some(result) = result {
                    rpc.resolve_result(result).await;
                }
            }
            Err(e) => {
                let delay = next_delay(&mut backoff, &reconnect);
                error!(
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "Result listener failed, reconnecting after backoff"
                );
                failing = true;
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Store every locally served schema with a fresh TTL.
async fn share_local_schemas(
    transport: &TransportAdapter,
    registry: &RwLock<ApiRegistry>,
    ttl: Duration,
) -> Result<()> {
    let schemas = registry.read().await.local_schemas();
    for schema in &schemas {
        transport.store_schema(schema, ttl).await?;
    }
    Ok(())
}

/// Keep this process's schemas alive in the broker and learn new or changed
/// schemas of other processes.
async fn run_schema_monitor(
    transport: Arc<TransportAdapter>,
    registry: Arc<RwLock<ApiRegistry>>,
    config: SchemaConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.refresh_interval(),
        config.refresh_interval(),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = share_local_schemas(&transport, &registry, config.ttl()).await {
                    warn!(error = %e, "Failed to refresh shared API schemas");
                    continue;
                }
                match transport.load_schemas().await {
                    Ok(schemas) => {
                        let mut registry = registry.write().await;
                        let learned = schemas
                            .into_iter()
                            .map(|schema| registry.learn_shared(schema))
                            .filter(|learned| *learned)
                            .count();
                        if learned > 0 {
                            info!(learned, "Learned shared API schemas");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to load shared API schemas"),
                }
            }
        }
    }
}

async fn run_sweeper(rpc: Arc<RpcEngine>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let expired = rpc.sweep().await;
                if expired > 0 {
                    debug!(expired, "Expired overdue RPC calls");
                }
            }
        }
    }
}
