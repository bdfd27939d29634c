//! relaybus-monitor: lifecycle monitor
//!
//! Joins the bus as its own service and logs every `internal.state` event,
//! so operators can watch processes start and stop.
//!
//! ## Configuration
//! - RELAYBUS_CONFIG: path to a YAML config file (default: relaybus.yaml, optional)
//! - RELAYBUS__*: overrides, e.g. RELAYBUS__TRANSPORT__TYPE=redis
//! - RELAYBUS_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::info;

use relaybus::error::HandlerError;
use relaybus::state::{state_schema, SERVER_STARTED, SERVER_STOPPED, STATE_API};
use relaybus::utils::{init_tracing, shutdown_signal};
use relaybus::{Bus, Config, EventMessage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = Config::load(None)?;
    if config.service_name == "default" {
        config.service_name = "relaybus-monitor".to_string();
    }

    let bus = Bus::connect(config).await?;
    bus.declare_remote(state_schema()).await?;
    for event in [SERVER_STARTED, SERVER_STOPPED] {
        bus.listen(
            STATE_API,
            event,
            "monitor",
            Arc::new(|event: Arc<EventMessage>| async move {
                info!(
                    event = %event.event_name,
                    service = %event.kwargs.get("service_name").cloned().unwrap_or_default(),
                    process = %event.kwargs.get("process_name").cloned().unwrap_or_default(),
                    apis = ?event.kwargs.get("api_names"),
                    listening_for = ?event.kwargs.get("listening_for"),
                    "Bus lifecycle event"
                );
                Ok::<(), HandlerError>(())
            }),
        )
        .await?;
    }

    info!(
        service = %bus.service_name(),
        process = %bus.process_name(),
        "relaybus-monitor started"
    );
    bus.run_until(shutdown_signal()).await?;
    Ok(())
}
