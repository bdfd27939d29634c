//! Internal `internal.state` API.
//!
//! Every bus with `state.enabled` serves this API and announces its
//! lifecycle on it, so operators can watch processes join and leave.

use serde_json::json;

use crate::api::{Api, ApiSchema};
use crate::error::Result;
use crate::events::EventKey;
use crate::message::Kwargs;

pub const STATE_API: &str = "internal.state";
pub const SERVER_STARTED: &str = "server_started";
pub const SERVER_STOPPED: &str = "server_stopped";

const STARTED_PARAMETERS: [&str; 4] = ["service_name", "process_name", "api_names", "listening_for"];
const STOPPED_PARAMETERS: [&str; 2] = ["service_name", "process_name"];

/// The API a bus serves to publish its own lifecycle events.
pub fn state_api() -> Result<Api> {
    Api::builder(STATE_API)
        .event(SERVER_STARTED, STARTED_PARAMETERS)
        .event(SERVER_STOPPED, STOPPED_PARAMETERS)
        .build()
}

/// Schema for processes that only listen to lifecycle events.
pub fn state_schema() -> ApiSchema {
    ApiSchema::new(STATE_API)
        .event(SERVER_STARTED, STARTED_PARAMETERS)
        .event(SERVER_STOPPED, STOPPED_PARAMETERS)
}

pub fn server_started(
    service_name: &str,
    process_name: &str,
    api_names: &[String],
    listening_for: &[EventKey],
) -> Kwargs {
    let listening_for: Vec<String> = listening_for
        .iter()
        .map(|(api, event)| format!("{}.{}", api, event))
        .collect();
    let mut kwargs = Kwargs::new();
    kwargs.insert("service_name".to_string(), json!(service_name));
    kwargs.insert("process_name".to_string(), json!(process_name));
    kwargs.insert("api_names".to_string(), json!(api_names));
    kwargs.insert("listening_for".to_string(), json!(listening_for));
    kwargs
}

pub fn server_stopped(service_name: &str, process_name: &str) -> Kwargs {
    let mut kwargs = Kwargs::new();
    kwargs.insert("service_name".to_string(), json!(service_name));
    kwargs.insert("process_name".to_string(), json!(process_name));
    kwargs
}
