//! Centralized default constants for the reindexing pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration types and services should reference these constants instead
//! of defining their own magic numbers.

// =============================================================================
// REINDEX BATCHING
// =============================================================================

/// Instances per watermark batch.
pub const REINDEX_BATCH_SIZE: i32 = 100;

/// Batches planned per round before the orchestrator re-reads its state.
pub const REINDEX_BATCH_COUNT: i32 = 5;

/// Instances reindexed concurrently within one batch.
pub const REINDEX_MAX_PARALLEL_INSTANCES: usize = 4;

// =============================================================================
// TAG LIMITS
// =============================================================================

/// Maximum number of extended query tags that may exist at once.
pub const MAX_EXTENDED_QUERY_TAG_COUNT: usize = 128;

// =============================================================================
// RETRY
// =============================================================================

/// Attempts per activity, including the first.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry in milliseconds.
pub const RETRY_BASE_DELAY_MS: u64 = 200;

/// Upper bound on the exponential retry delay in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 5_000;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for tag listings.
pub const PAGE_LIMIT: i64 = 100;

/// Default page offset.
pub const PAGE_OFFSET: i64 = 0;

// =============================================================================
// WORKER
// =============================================================================

/// Capacity of the worker event broadcast channel.
pub const WORKER_EVENT_CAPACITY: usize = 256;

/// Seconds to wait for running orchestrations during shutdown.
pub const WORKER_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Milliseconds between scans for active operations without a running task.
pub const WORKER_POLL_INTERVAL_MS: u64 = 5_000;
