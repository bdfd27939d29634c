//! Process bootstrap and retry helpers.

pub mod bootstrap;
pub mod retry;

pub use bootstrap::{init_tracing, shutdown_signal};
