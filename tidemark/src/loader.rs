//! Retrying event-page loader used by shard agents.

use crate::errors::LoaderError;
use crate::event::EventPage;
use crate::store::EventStore;
use crate::types::{Sequence, ShardName};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Retry budget and backoff shape for page fetches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Randomize each delay by +/-20% to avoid thundering herds.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let millis = if self.use_jitter {
            capped * rand::rng().random_range(0.8..1.2)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

/// Wraps the store's page reads in a bounded retry loop.
///
/// Infrastructure blips during a page fetch retry with exponential backoff;
/// only after the budget is exhausted does the agent see a [`LoaderError`]
/// carrying the shard and database identity. Loader failures never crash the
/// daemon.
#[derive(Debug)]
pub struct ResilientLoader<S> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: EventStore> ResilientLoader<S> {
    /// Creates a loader over `store` with the given retry policy.
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Reads events with sequence in `(floor, ceiling]`, retrying transient
    /// failures up to the policy's budget.
    pub async fn load(
        &self,
        shard: &ShardName,
        floor: Sequence,
        ceiling: Sequence,
        limit: usize,
    ) -> Result<EventPage<S::Event>, LoaderError> {
        let mut last_error = None;
        for attempt in 0..self.policy.max_attempts {
            match self.store.read_page(floor, ceiling, limit).await {
                Ok(page) => return Ok(page),
                Err(error) => {
                    warn!(
                        shard = %shard,
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        error = %error,
                        "page fetch failed"
                    );
                    last_error = Some(error);
                    if attempt + 1 < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(LoaderError {
            shard: shard.clone(),
            database: self.store.database_identifier(),
            attempts: self.policy.max_attempts,
            source: last_error.expect("at least one attempt was made"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            use_jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_near_the_nominal_delay() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(80));
            assert!(d <= Duration::from_millis(120));
        }
    }
}
