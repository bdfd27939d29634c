//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter: a bounded window for
//! reaching the broker at startup, an unbounded one for reconnecting while
//! running.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{info, warn};

use crate::config::{ReconnectConfig, StartupConfig};

/// Backoff for reaching the broker while starting.
///
/// Bounded: after `connect_attempts` retries startup fails.
pub fn startup_backoff(config: &StartupConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.connect_attempts)
        .with_jitter()
}

/// Backoff between reconnect attempts while running.
///
/// Callers keep retrying until shutdown, falling back to `max_delay_ms` once
/// the iterator is exhausted (see [`next_delay`]).
pub fn reconnect_backoff(config: &ReconnectConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(32)
        .with_jitter()
}

/// Next reconnect delay, capped at the configured maximum.
pub fn next_delay(backoff: &mut impl Iterator<Item = Duration>, config: &ReconnectConfig) -> Duration {
    backoff
        .next()
        .unwrap_or(Duration::from_millis(config.max_delay_ms))
}

/// Run `operation` until it succeeds or the startup window closes.
///
/// The first attempt runs immediately. When every attempt fails the last
/// error is returned.
pub async fn retry_startup<T, E, F, Fut>(
    config: &StartupConfig,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delays = startup_backoff(config).build();
    let mut attempt = 0usize;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = what, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                let Some(delay) = delays.next() else {
                    return Err(e);
                };
                attempt += 1;
                warn!(
                    operation = what,
                    attempt,
                    max_retries = config.connect_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Startup step failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
