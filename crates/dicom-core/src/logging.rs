//! Structured logging schema and field name constants.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation can query by standardized names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue: instance failure recorded, retry scheduled |
//! | INFO  | Lifecycle events: operation prepared, batch checkpointed, completed |
//! | DEBUG | Decision points, planned batches, config choices |
//! | TRACE | Per-instance iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "reindexer"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "orchestrator", "worker", "tag_store"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "prepare", "reindex_batch", "complete", "delete_tag"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Reindex operation id.
pub const OPERATION_ID: &str = "operation_id";

/// Extended query tag key.
pub const TAG_KEY: &str = "tag_key";

/// Extended query tag path.
pub const TAG_PATH: &str = "tag_path";

/// Instance watermark.
pub const WATERMARK: &str = "watermark";

/// Inclusive lower bound of a batch.
pub const BATCH_START: &str = "batch_start";

/// Inclusive upper bound of a batch.
pub const BATCH_END: &str = "batch_end";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of instances in a batch.
pub const INSTANCE_COUNT: &str = "instance_count";

/// Number of per-instance failures recorded.
pub const FAILURE_COUNT: &str = "failure_count";

/// Retry attempt number, starting at 1.
pub const ATTEMPT: &str = "attempt";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

/// Deployed schema version.
pub const SCHEMA_VERSION: &str = "schema_version";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
