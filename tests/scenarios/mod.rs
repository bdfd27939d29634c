//! Bus scenarios shared by every broker implementation.
//!
//! Each broker test file passes an async `Harness` constructor to
//! `run_bus_scenarios!`; every scenario gets a fresh harness.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use relaybus::{Api, BusError, EventMessage, HandlerError, Kwargs};

use crate::common::*;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// RPC
// =============================================================================

pub async fn test_rpc_round_trip(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    let client = harness.bus("web", "web-1");
    client.declare_remote(auth_schema()).await.unwrap();
    server.start().await.unwrap();
    client.start().await.unwrap();

    let value = client
        .call("auth", "check_password", admin_credentials())
        .await
        .unwrap();
    assert_eq!(value, json!(true));

    let wrong = kwargs(&[("user", json!("admin")), ("password", json!("guess"))]);
    let value = client.call("auth", "check_password", wrong).await.unwrap();
    assert_eq!(value, json!(false));
    assert_eq!(client.pending_calls().await, 0);

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

pub async fn test_remote_error(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    let client = harness.bus("web", "web-1");
    client.declare_remote(auth_schema()).await.unwrap();
    server.start().await.unwrap();
    client.start().await.unwrap();

    let err = client
        .call("auth", "explode", kwargs(&[("reason", json!("disk full"))]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, BusError::Remote { ref message, .. } if message == "disk full"),
        "unexpected error: {:?}",
        err
    );

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

/// Requests sent before any server runs are served once one starts.
pub async fn test_request_waits_for_server(harness: &Harness) {
    let client = harness.bus("web", "web-1");
    client.declare_remote(auth_schema()).await.unwrap();
    client.start().await.unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_with_timeout("auth", "check_password", admin_credentials(), WAIT)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    server.start().await.unwrap();

    assert_eq!(call.await.unwrap().unwrap(), json!(true));

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

/// Every request is served by exactly one of the processes serving the API.
pub async fn test_competing_consumers(harness: &Harness) {
    let served: Arc<Mutex<Vec<String>>> = Default::default();
    let mut servers = Vec::new();
    for process in ["counter-1", "counter-2"] {
        let bus = harness.bus("counter", process);
        let served = served.clone();
        let name = process.to_string();
        let api = Api::builder("counter")
            .method("take", ["n"], move |kwargs: Kwargs| {
                let served = served.clone();
                let name = name.clone();
                async move {
                    served.lock().expect("served lock").push(name.clone());
                    Ok::<Value, HandlerError>(json!({ "n": kwargs["n"], "by": name }))
                }
            })
            .build()
            .unwrap();
        bus.register_api(api).await.unwrap();
        bus.start().await.unwrap();
        servers.push(bus);
    }

    let client = harness.bus("web", "web-1");
    client
        .declare_remote(relaybus::ApiSchema::new("counter").method("take", ["n"]))
        .await
        .unwrap();
    client.start().await.unwrap();

    let calls = (0..20).map(|n| {
        let client = client.clone();
        async move { client.call("counter", "take", kwargs(&[("n", json!(n))])).await }
    });
    let results = futures::future::join_all(calls).await;

    let mut answered = HashSet::new();
    for result in results {
        let value = result.unwrap();
        assert!(answered.insert(value["n"].as_u64().unwrap()));
    }
    assert_eq!(answered.len(), 20);
    assert_eq!(served.lock().unwrap().len(), 20);

    client.shutdown().await.unwrap();
    for server in servers {
        server.shutdown().await.unwrap();
    }
}

pub async fn test_timeout_then_late_result_discarded(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    let client = harness.bus("web", "web-1");
    client.declare_remote(auth_schema()).await.unwrap();
    server.start().await.unwrap();
    client.start().await.unwrap();

    let started = Instant::now();
    let err = client
        .call_with_timeout(
            "auth",
            "slow",
            kwargs(&[("ms", json!(300))]),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RpcTimeout { .. }));
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(client.pending_calls().await, 0);

    // The late result arrives while the next call is in flight and must not
    // be mistaken for its answer.
    let value = client
        .call("auth", "slow", kwargs(&[("ms", json!(400))]))
        .await
        .unwrap();
    assert_eq!(value, json!(400));

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

/// A call to an API nobody serves times out.
pub async fn test_call_without_server_times_out(harness: &Harness) {
    let client = harness.bus("web", "web-1");
    client.declare_remote(auth_schema()).await.unwrap();
    client.start().await.unwrap();

    let err = client
        .call_with_timeout(
            "auth",
            "check_password",
            admin_credentials(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RpcTimeout { .. }));
    assert!(err.to_string().contains("no process is serving"));

    client.shutdown().await.unwrap();
}

pub async fn test_unknown_api_leaves_no_pending_call(harness: &Harness) {
    let client = harness.bus("web", "web-1");
    client.start().await.unwrap();

    let err = client
        .call("billing", "charge", kwargs(&[("amount", json!(5))]))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ApiNotFound(_)));
    assert_eq!(client.pending_calls().await, 0);

    client.shutdown().await.unwrap();
}

/// A handler may call another API while holding the only worker: results are
/// resolved outside the worker pool.
pub async fn test_nested_call_from_handler(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();

    let mut config = harness.config("gateway", "gateway-1");
    config.dispatch.max_concurrency = 1;
    let gateway = harness.bus_with(config);
    gateway.declare_remote(auth_schema()).await.unwrap();
    let inner = gateway.clone();
    let api = Api::builder("gateway")
        .method("login", ["user", "password"], move |kwargs: Kwargs| {
            let bus = inner.clone();
            async move {
                let ok = bus.call("auth", "check_password", kwargs).await?;
                Ok::<Value, HandlerError>(json!({ "logged_in": ok }))
            }
        })
        .build()
        .unwrap();
    gateway.register_api(api).await.unwrap();

    let client = harness.bus("web", "web-1");
    client
        .declare_remote(relaybus::ApiSchema::new("gateway").method("login", ["user", "password"]))
        .await
        .unwrap();

    server.start().await.unwrap();
    gateway.start().await.unwrap();
    client.start().await.unwrap();

    let value = client
        .call("gateway", "login", admin_credentials())
        .await
        .unwrap();
    assert_eq!(value, json!({ "logged_in": true }));

    client.shutdown().await.unwrap();
    gateway.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

/// Callers still waiting when the grace period ends get `Shutdown`.
pub async fn test_shutdown_fails_pending_calls(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    let mut config = harness.config("web", "web-1");
    config.shutdown.grace_period_ms = 100;
    let client = harness.bus_with(config);
    client.declare_remote(auth_schema()).await.unwrap();
    server.start().await.unwrap();
    client.start().await.unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_with_timeout("auth", "slow", kwargs(&[("ms", json!(2000))]), WAIT)
                .await
        })
    };
    {
        let deadline = Instant::now() + WAIT;
        while client.pending_calls().await == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let started = Instant::now();
    client.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(call.await.unwrap(), Err(BusError::Shutdown)));

    let err = client
        .call("auth", "check_password", admin_credentials())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::InvalidState(_)));

    server.shutdown().await.unwrap();
}

// =============================================================================
// Events
// =============================================================================

pub async fn test_event_delivered_with_exact_kwargs(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    let audit = harness.bus("audit", "audit-1");
    audit.declare_remote(auth_schema()).await.unwrap();
    let log: DeliveryLog = Default::default();
    audit
        .listen("auth", "user_registered", "record", RecordingListener::new("record", &log))
        .await
        .unwrap();
    server.start().await.unwrap();
    audit.start().await.unwrap();

    let position = server
        .publish("auth", "user_registered", bob_registered())
        .await
        .unwrap();

    assert!(eventually(WAIT, || log.lock().unwrap().len() == 1).await);
    let (_, event) = log.lock().unwrap()[0].clone();
    assert_eq!(event.api_name, "auth");
    assert_eq!(event.event_name, "user_registered");
    assert_eq!(event.kwargs, bob_registered());
    assert_eq!(event.position, Some(position));

    audit.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

/// Every service sees every event; processes of one service share them.
pub async fn test_event_fan_out(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();

    let audit = CountingListener::new();
    let mailers = [CountingListener::new(), CountingListener::new()];
    let mut listeners = Vec::new();

    let bus = harness.bus("audit", "audit-1");
    bus.declare_remote(auth_schema()).await.unwrap();
    bus.listen("auth", "user_registered", "audit", audit.clone())
        .await
        .unwrap();
    listeners.push(bus);
    for (i, mailer) in mailers.iter().enumerate() {
        let bus = harness.bus("mailer", &format!("mailer-{}", i));
        bus.declare_remote(auth_schema()).await.unwrap();
        bus.listen("auth", "user_registered", "mail", mailer.clone())
            .await
            .unwrap();
        listeners.push(bus);
    }

    server.start().await.unwrap();
    for bus in &listeners {
        bus.start().await.unwrap();
    }

    for _ in 0..10 {
        server
            .publish("auth", "user_registered", bob_registered())
            .await
            .unwrap();
    }

    assert!(eventually(WAIT, || audit.count() == 10).await);
    assert!(eventually(WAIT, || mailers[0].count() + mailers[1].count() == 10).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(audit.count(), 10);
    assert_eq!(mailers[0].count() + mailers[1].count(), 10);

    for bus in listeners {
        bus.shutdown().await.unwrap();
    }
    server.shutdown().await.unwrap();
}

/// Listeners run in registration order; failures and panics are isolated.
pub async fn test_listener_order_and_isolation(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    let log: DeliveryLog = Default::default();
    server
        .listen("auth", "user_registered", "first", RecordingListener::new("first", &log))
        .await
        .unwrap();
    server
        .listen(
            "auth",
            "user_registered",
            "broken",
            Arc::new(FailingListener { panics: false }),
        )
        .await
        .unwrap();
    server
        .listen(
            "auth",
            "user_registered",
            "crashing",
            Arc::new(FailingListener { panics: true }),
        )
        .await
        .unwrap();
    server
        .listen("auth", "user_registered", "last", RecordingListener::new("last", &log))
        .await
        .unwrap();
    server.start().await.unwrap();

    server
        .publish("auth", "user_registered", bob_registered())
        .await
        .unwrap();
    server
        .publish(
            "auth",
            "user_registered",
            kwargs(&[("username", json!("eve")), ("email", json!("eve@x.com"))]),
        )
        .await
        .unwrap();

    assert!(eventually(WAIT, || log.lock().unwrap().len() == 4).await);
    let order: Vec<(String, Value)> = log
        .lock()
        .unwrap()
        .iter()
        .map(|(name, event): &(String, Arc<EventMessage>)| {
            (name.clone(), event.kwargs["username"].clone())
        })
        .collect();
    // One event at a time per listener set; the two events may interleave.
    let listeners_for = |user: &str| {
        order
            .iter()
            .filter(|(_, u)| u == user)
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
    };
    assert_eq!(listeners_for("bob"), vec!["first", "last"]);
    assert_eq!(listeners_for("eve"), vec!["first", "last"]);

    server.shutdown().await.unwrap();
}

pub async fn test_listen_after_start_rejected(harness: &Harness) {
    let server = harness.bus("auth", "auth-1");
    server.register_api(auth_api()).await.unwrap();
    server.start().await.unwrap();

    let err = server
        .listen("auth", "user_registered", "late", CountingListener::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ListenAfterStart { .. }));

    server.shutdown().await.unwrap();
}

#[macro_export]
macro_rules! run_bus_scenarios {
    ($make_harness:path) => {
        use $crate::scenarios::*;

        test_rpc_round_trip(&$make_harness().await).await;
        println!("  test_rpc_round_trip: PASSED");

        test_remote_error(&$make_harness().await).await;
        println!("  test_remote_error: PASSED");

        test_request_waits_for_server(&$make_harness().await).await;
        println!("  test_request_waits_for_server: PASSED");

        test_competing_consumers(&$make_harness().await).await;
        println!("  test_competing_consumers: PASSED");

        test_timeout_then_late_result_discarded(&$make_harness().await).await;
        println!("  test_timeout_then_late_result_discarded: PASSED");

        test_call_without_server_times_out(&$make_harness().await).await;
        println!("  test_call_without_server_times_out: PASSED");

        test_unknown_api_leaves_no_pending_call(&$make_harness().await).await;
        println!("  test_unknown_api_leaves_no_pending_call: PASSED");

        test_nested_call_from_handler(&$make_harness().await).await;
        println!("  test_nested_call_from_handler: PASSED");

        test_shutdown_fails_pending_calls(&$make_harness().await).await;
        println!("  test_shutdown_fails_pending_calls: PASSED");

        test_event_delivered_with_exact_kwargs(&$make_harness().await).await;
        println!("  test_event_delivered_with_exact_kwargs: PASSED");

        test_event_fan_out(&$make_harness().await).await;
        println!("  test_event_fan_out: PASSED");

        test_listener_order_and_isolation(&$make_harness().await).await;
        println!("  test_listener_order_and_isolation: PASSED");

        test_listen_after_start_rejected(&$make_harness().await).await;
        println!("  test_listen_after_start_rejected: PASSED");
    };
}
