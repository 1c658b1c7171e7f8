use crate::ingest::source::SourceError;
use std::{future::Future, time::Duration};
use tokio::{
    sync::Mutex,
    time::{sleep, sleep_until, Instant}
};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub max_delay: Duration
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_secs(1),
            factor: 2,
            max_attempts: 5,
            max_delay: Duration::from_secs(30)
        }
    }
}

impl BackoffPolicy {
    /// Pause before retry number `retry` (1 for the first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(retry.saturating_sub(1));

        self.base.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Spaces out calls to one external origin. Grants are handed out one at a time and
/// never closer together than `interval`.
pub struct RateLimiter {
    origin: String,
    interval: Duration,
    backoff: BackoffPolicy,
    last_grant: Mutex<Option<Instant>>
}

impl RateLimiter {
    pub fn new(origin: impl Into<String>, interval: Duration, backoff: BackoffPolicy) -> RateLimiter {
        RateLimiter {
            origin: origin.into(),
            interval,
            backoff,
            last_grant: Mutex::new(None)
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Suspends until at least `interval` has passed since the previous grant
    pub async fn acquire(&self) {
        let mut last_grant = self.last_grant.lock().await;

        if let Some(previous) = *last_grant {
            sleep_until(previous + self.interval).await;
        }

        *last_grant = Some(Instant::now());
    }

    /// Runs `op` behind the limiter. Transient failures are retried with exponential
    /// backoff until the attempts run out; anything else is returned immediately.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>
    {
        let mut attempt = 1;

        loop {
            self.acquire().await;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        origin = %self.origin,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying: {}",
                        e
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e)
            }
        }
    }
}
