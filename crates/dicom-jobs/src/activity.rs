//! Retrying runner for orchestration activities.
//!
//! Every store call the orchestrator makes is an activity: a discrete unit of
//! work that is retried on transient storage faults and surfaced unchanged
//! otherwise.

use std::future::Future;

use tracing::warn;

use dicom_core::Result;

use crate::config::RetryPolicy;

/// Run an activity, retrying transient failures with backoff.
pub async fn run_activity<T, F, Fut>(
    policy: RetryPolicy,
    activity: &'static str,
    operation_id: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_transient() || attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    subsystem = "jobs",
                    component = "activity",
                    op = activity,
                    operation_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Activity failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
