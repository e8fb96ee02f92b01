//! Reconnection supervisor
//!
//! After an unexpected disconnect the supervisor keeps trying to connect,
//! waiting an exponentially growing, jittered delay between attempts. It
//! exits once a connect and the full refresh after it leave the client
//! available.

use crate::client::WeakClient;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Upper bound of the exponential part of the delay, in seconds
pub const MAX_BACKOFF_SECS: u64 = 64;

/// Retry count below which the delay does not shrink further
const MIN_BACKOFF_EXPONENT: u32 = 2;

/// Delay before reconnection attempt `retry_count`
///
/// `min(64, 2^max(retry_count, 2))` seconds plus up to one second of jitter,
/// rounded to milliseconds.
pub fn backoff(retry_count: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..1.0);
    backoff_with_jitter(retry_count, jitter)
}

fn backoff_with_jitter(retry_count: u32, jitter: f64) -> Duration {
    let exponent = retry_count.clamp(MIN_BACKOFF_EXPONENT, 16);
    let base = 2u64.pow(exponent).min(MAX_BACKOFF_SECS) as f64;
    Duration::from_millis(((base + jitter) * 1000.0).round() as u64)
}

/// Supervisor loop, run as a background task
///
/// Aborting the task ends the loop; it is never retried.
pub(crate) async fn run(weak: WeakClient) {
    let mut retry_count = 0;
    loop {
        let delay = backoff(retry_count);
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, retry_count + 1);
        sleep(delay).await;

        let Some(client) = weak.upgrade() else {
            return;
        };
        if !client.reconnect_enabled() {
            tracing::debug!("Reconnection disabled, supervisor exiting");
            return;
        }

        match client.connect().await {
            Ok(()) if client.available() => match client.update(true).await {
                Ok(_) if client.available() => {
                    tracing::info!("Reconnected to {}", client.address());
                    return;
                }
                Ok(_) => tracing::warn!("Lost {} again during refresh", client.address()),
                Err(e) => tracing::warn!("Refresh after reconnect failed: {}", e),
            },
            Ok(()) => tracing::debug!("Connect skipped, another attempt is in progress"),
            Err(e) => tracing::warn!("Reconnect to {} failed: {}", client.address(), e),
        }
        retry_count += 1;
    }
}
