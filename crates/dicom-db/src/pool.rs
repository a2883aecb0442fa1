//! Connection pool sized for the reindex fan-out.
//!
//! Each in-flight instance holds one connection while its index rows are
//! written, so the pool needs at least `max_parallel_instances` connections
//! plus room for checkpoint writes and the worker's operation scan.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use dicom_core::{defaults, Error, Result};

/// Connections reserved beyond the instance fan-out.
pub const POOL_HEADROOM: u32 = 4;

/// Seconds to wait for a free connection before failing the call.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds an unused connection is kept open.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_parallelism(defaults::REINDEX_MAX_PARALLEL_INSTANCES)
    }
}

impl PoolConfig {
    /// Size the pool for `max_parallel_instances` concurrent reindex calls.
    pub fn for_parallelism(max_parallel_instances: usize) -> Self {
        let fan_out = u32::try_from(max_parallel_instances.max(1)).unwrap_or(u32::MAX);
        Self {
            max_connections: fan_out.saturating_add(POOL_HEADROOM),
            min_connections: 1,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Size for `max_parallel_instances`, then apply `DATABASE_MAX_CONNECTIONS`
    /// and `DATABASE_ACQUIRE_TIMEOUT_SECS` when set.
    pub fn from_env(max_parallel_instances: usize) -> Self {
        let mut config = Self::for_parallelism(max_parallel_instances);
        if let Some(n) = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.max_connections = n.max(1);
        }
        if let Some(secs) = std::env::var("DATABASE_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if (config.max_connections as usize) <= max_parallel_instances {
            warn!(
                subsystem = "db",
                component = "pool",
                max_connections = config.max_connections,
                max_parallel_instances,
                "Pool is not larger than the instance fan-out, reindex calls will queue"
            );
        }
        config
    }
}

/// Open a pool with the given configuration.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}

/// Log current pool usage; warns when no idle connection is left.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "db",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool usage"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = size,
            "Connection pool has no idle connections, reindex fan-out may stall"
        );
    }
}
