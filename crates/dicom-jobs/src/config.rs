//! Reindex configuration.

use std::time::Duration;

use dicom_core::defaults;

/// Bounded exponential backoff for retryable activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first try.
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on any single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(30);
        let delay = self.base_delay_ms.saturating_mul(1u64 << pow);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Configuration for reindex orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexConfig {
    /// Instances per batch.
    pub batch_size: i32,
    /// Batches planned per round.
    pub batch_count: i32,
    /// Instances reindexed concurrently within one batch.
    pub max_parallel_instances: usize,
    /// Cap on registered extended query tags.
    pub max_tag_count: usize,
    /// Retry policy for store activities.
    pub retry: RetryPolicy,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::REINDEX_BATCH_SIZE,
            batch_count: defaults::REINDEX_BATCH_COUNT,
            max_parallel_instances: defaults::REINDEX_MAX_PARALLEL_INSTANCES,
            max_tag_count: defaults::MAX_EXTENDED_QUERY_TAG_COUNT,
            retry: RetryPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl ReindexConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REINDEX_BATCH_SIZE` | `100` | Instances per batch |
    /// | `REINDEX_BATCH_COUNT` | `5` | Batches planned per round |
    /// | `REINDEX_MAX_PARALLEL` | `4` | Concurrent instances per batch |
    /// | `REINDEX_MAX_TAG_COUNT` | `128` | Max registered tags |
    /// | `REINDEX_RETRY_MAX_ATTEMPTS` | `3` | Attempts per activity |
    /// | `REINDEX_RETRY_BASE_DELAY_MS` | `200` | First retry delay |
    /// | `REINDEX_RETRY_MAX_DELAY_MS` | `5000` | Retry delay cap |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            batch_size: env_parse("REINDEX_BATCH_SIZE")
                .unwrap_or(base.batch_size)
                .max(1),
            batch_count: env_parse("REINDEX_BATCH_COUNT")
                .unwrap_or(base.batch_count)
                .max(1),
            max_parallel_instances: env_parse("REINDEX_MAX_PARALLEL")
                .unwrap_or(base.max_parallel_instances)
                .max(1),
            max_tag_count: env_parse("REINDEX_MAX_TAG_COUNT")
                .unwrap_or(base.max_tag_count)
                .max(1),
            retry: RetryPolicy {
                max_attempts: env_parse("REINDEX_RETRY_MAX_ATTEMPTS")
                    .unwrap_or(base.retry.max_attempts)
                    .max(1),
                base_delay_ms: env_parse("REINDEX_RETRY_BASE_DELAY_MS")
                    .unwrap_or(base.retry.base_delay_ms),
                max_delay_ms: env_parse("REINDEX_RETRY_MAX_DELAY_MS")
                    .unwrap_or(base.retry.max_delay_ms),
            },
        }
    }

    pub fn with_batch_size(mut self, size: i32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_batch_count(mut self, count: i32) -> Self {
        self.batch_count = count.max(1);
        self
    }

    pub fn with_max_parallel_instances(mut self, max: usize) -> Self {
        self.max_parallel_instances = max.max(1);
        self
    }

    pub fn with_max_tag_count(mut self, max: usize) -> Self {
        self.max_tag_count = max.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
