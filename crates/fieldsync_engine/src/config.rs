//! Configuration for the sync engine.

use fieldsync_protocol::collections;
use rand::Rng;
use std::time::Duration;

/// Configuration for a [`crate::SyncManager`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device id (unique per installation), used in logs.
    pub device_id: String,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Operations applied per outbox read. A drain pass reads again until
    /// nothing is due.
    pub drain_batch_size: usize,
    /// Remote collections the change listener subscribes to.
    pub collections: Vec<String>,
}

impl SyncConfig {
    /// Creates a configuration for the given device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            retry: RetryConfig::default(),
            drain_batch_size: 50,
            collections: collections::REPLICATED
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the drain batch size.
    pub fn with_drain_batch_size(mut self, size: usize) -> Self {
        self.drain_batch_size = size.max(1);
        self
    }

    /// Sets the subscribed collections.
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Configuration for retry backoff.
///
/// The delay before retry `n` (0-indexed) is
/// `min(max_delay, base_delay * 2^n)`, multiplied by a uniform factor in
/// `[0.5, 1.5)` when jitter is on.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound of the un-jittered delay.
    pub max_delay: Duration,
    /// Whether to randomize delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given bounds and jitter enabled.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculates the delay after a failure at the given attempt count.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let cap = self.max_delay.as_secs_f64();
        // The cap is reached long before 2^31.
        let factor = 2f64.powi(attempt.min(31) as i32);
        let delay = (base * factor).min(cap);

        if self.jitter {
            Duration::from_secs_f64(delay * rand::thread_rng().gen_range(0.5..1.5))
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(300_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("tablet-7")
            .with_drain_batch_size(10)
            .with_collections(["jobs", "policy"])
            .with_retry(RetryConfig::default().with_jitter(false));

        assert_eq!(config.device_id, "tablet-7");
        assert_eq!(config.drain_batch_size, 10);
        assert_eq!(config.collections, vec!["jobs", "policy"]);
        assert!(!config.retry.jitter);
    }

    #[test]
    fn default_config_listens_to_replicated_collections() {
        let config = SyncConfig::default();
        assert_eq!(config.collections.len(), collections::REPLICATED.len());
        assert!(!config.device_id.is_empty());
    }

    #[test]
    fn retry_delay_doubles_until_cap() {
        let config = RetryConfig::default().with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_in_bounds(attempt in 0u32..40) {
            let config = RetryConfig::default();
            let plain = config.clone().with_jitter(false).delay_for_attempt(attempt);
            let jittered = config.delay_for_attempt(attempt);

            let (plain, jittered) = (plain.as_secs_f64(), jittered.as_secs_f64());
            prop_assert!(jittered >= plain * 0.5 - 1e-6);
            prop_assert!(jittered <= plain * 1.5 + 1e-6);
        }
    }
}
