use std::future::Future;
use std::time::Duration;

use super::DhtError;
use crate::config::SyncConfig;

/// Exponential backoff for DHT calls that hit an unavailable network
///
/// Only `DhtError::Unavailable` is retried; conflicts and protection
/// failures are answers, not outages.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            retries: config.io_retries,
            base_delay: Duration::from_millis(config.io_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, DhtError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DhtError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(DhtError::Unavailable(reason)) if attempt < self.retries => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "dht {} unavailable ({}), retry {}/{} in {:?}",
                        what,
                        reason,
                        attempt,
                        self.retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}
