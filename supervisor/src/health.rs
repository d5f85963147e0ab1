//! HTTP health probing of launched instances.

use std::time::Duration;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

/// Fixed pause between probe attempts. No backoff: the endpoint is expected
/// to flip from unavailable to available, not to be slow.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Default attempt budget (15 s at the fixed cadence).
pub const DEFAULT_ATTEMPTS: usize = 30;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// The endpoint answered 200.
    Healthy,
    /// The endpoint answered, but not with 200.
    Unhealthy,
    /// Connection refused/reset, or the request timed out.
    Unreachable,
}

/// A single probe of `url`.
pub async fn probe(client: &reqwest::Client, url: &str) -> Health {
    match client.get(url).timeout(REQUEST_TIMEOUT).send().await {
        Ok(response) if response.status().is_success() => Health::Healthy,
        Ok(_) => Health::Unhealthy,
        Err(_) => Health::Unreachable,
    }
}

/// Polls `url` until it answers 200 or the attempt budget is spent.
/// Returns whether the endpoint became healthy.
pub async fn wait_healthy(client: &reqwest::Client, url: &str, attempts: usize) -> bool {
    let cadence = FixedInterval::new(PROBE_INTERVAL).take(attempts.saturating_sub(1));
    Retry::spawn(cadence, || async {
        match probe(client, url).await {
            Health::Healthy => Ok(()),
            other => Err(other),
        }
    })
    .await
    .is_ok()
}
