//! Relaybus - message bus core
//!
//! Connects backend processes through a shared broker for two interaction
//! patterns: RPC calls answered by exactly one serving process, and events
//! fanned out to every listening service.

pub mod api;
pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod rpc;
pub mod state;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use api::{Api, ApiBuilder, ApiSchema, RpcHandler};
pub use broker::{Broker, MemoryBroker, StartFrom};
pub use bus::{Bus, BusState};
pub use codec::Codec;
pub use config::Config;
pub use error::{BusError, HandlerError, Result};
pub use events::EventListener;
pub use message::{EventMessage, Kwargs, Position};
