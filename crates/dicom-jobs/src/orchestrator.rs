//! Reindex orchestrator state machine.
//!
//! An operation moves `Prepared -> Batching -> Reindexing* -> Completing ->
//! Completed`, or to `Cancelled` once every tag has been paused out of it.
//! All progress lives in the reindex state store: after each batch the
//! uncovered range shrinks to `[start, batch.start - 1]`, so a restarted
//! orchestration re-prepares, reads the stored range and replays at most the
//! batch that was in flight.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use dicom_core::{
    percent_complete, Error, ExtendedQueryTagErrorStore, ExtendedQueryTagStatus,
    IndexDataStore, IndexStatus, InstanceMetadataStore, InstanceReindexer, InstanceStore,
    ReindexOperation, ReindexStateStore, Result, TagDefinition, TagKey, ValidationErrorCode,
    VersionedInstanceIdentifier, WatermarkRange,
};
use dicom_db::Database;

use crate::activity::run_activity;
use crate::config::ReindexConfig;
use crate::reindexer::MetadataReindexer;
use crate::worker::WorkerEvent;

/// Store handles an orchestration works against.
#[derive(Clone)]
pub struct ReindexStores {
    pub errors: Arc<dyn ExtendedQueryTagErrorStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub reindex: Arc<dyn ReindexStateStore>,
    pub reindexer: Arc<dyn InstanceReindexer>,
}

impl ReindexStores {
    /// Wire the PostgreSQL stores with a metadata source.
    pub fn from_database(db: &Database, metadata: Arc<dyn InstanceMetadataStore>) -> Self {
        let index: Arc<dyn IndexDataStore> = Arc::new(db.index_data.clone());
        Self {
            errors: Arc::new(db.tag_errors.clone()),
            instances: Arc::new(db.instances.clone()),
            reindex: Arc::new(db.reindex.clone()),
            reindexer: Arc::new(MetadataReindexer::new(metadata, index)),
        }
    }
}

/// Where an orchestration is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Tags are bound and the uncovered range is known.
    Prepared,
    /// Planning the next round of batches below the uncovered end.
    Batching,
    /// Reindexing one batch, checkpointed when done.
    Reindexing(WatermarkRange),
    /// Every watermark is covered; promoting tags to Ready.
    Completing,
    Completed,
    /// No tag is left processing.
    Cancelled,
}

impl OrchestratorState {
    /// Next state for a freshly loaded operation snapshot.
    pub fn resolve(operation: &ReindexOperation) -> Self {
        if operation.tags.is_empty() {
            OrchestratorState::Cancelled
        } else if operation.is_fully_covered() {
            OrchestratorState::Completing
        } else {
            OrchestratorState::Batching
        }
    }
}

/// How an orchestration run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReindexOutcome {
    /// All tags promoted to Ready.
    Completed { tags: Vec<TagDefinition> },
    /// Every tag was paused out of the operation.
    Cancelled,
    /// Shutdown was requested; the operation resumes from its checkpoint.
    Interrupted,
}

/// Drives one reindex operation to a terminal state.
pub struct ReindexOrchestrator {
    stores: ReindexStores,
    config: ReindexConfig,
    events: Option<broadcast::Sender<WorkerEvent>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ReindexOrchestrator {
    pub fn new(stores: ReindexStores, config: ReindexConfig) -> Self {
        Self {
            stores,
            config,
            events: None,
            shutdown: None,
        }
    }

    /// Publish checkpoints on a worker event channel.
    pub fn with_events(mut self, events: broadcast::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Stop between batches once the receiver reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Bind `tag_keys` to `operation_id` (or resume it) and run to the end.
    pub async fn run(&self, operation_id: &str, tag_keys: &[TagKey]) -> Result<ReindexOutcome> {
        let started = Instant::now();
        let retry = self.config.retry;
        let reindex = self.stores.reindex.as_ref();

        let mut operation = run_activity(retry, "prepare", operation_id, move || {
            reindex.prepare(tag_keys, operation_id)
        })
        .await?;

        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "prepare",
            operation_id,
            tag_count = operation.tags.len(),
            remaining = ?operation.remaining,
            "Reindex operation prepared"
        );

        let mut pending: VecDeque<WatermarkRange> = VecDeque::new();
        let mut state = OrchestratorState::Prepared;
        let mut ready: Vec<TagDefinition> = Vec::new();

        loop {
            debug!(
                subsystem = "jobs",
                component = "orchestrator",
                operation_id,
                state = ?state,
                "Orchestrator step"
            );
            state = match state {
                OrchestratorState::Prepared => OrchestratorState::resolve(&operation),

                OrchestratorState::Batching => match operation.remaining {
                    None => OrchestratorState::resolve(&operation),
                    Some(remaining) => {
                        pending = self.plan_batches(operation_id, remaining).await?.into();
                        match pending.pop_front() {
                            Some(batch) => OrchestratorState::Reindexing(batch),
                            None => {
                                // Nothing stored below the uncovered end.
                                operation = self
                                    .checkpoint(operation_id, remaining.start - 1)
                                    .await?;
                                OrchestratorState::resolve(&operation)
                            }
                        }
                    }
                },

                OrchestratorState::Reindexing(batch) => {
                    if self.shutdown_requested() {
                        info!(
                            subsystem = "jobs",
                            component = "orchestrator",
                            operation_id,
                            batch_start = batch.start,
                            batch_end = batch.end,
                            "Shutdown requested, leaving operation at its checkpoint"
                        );
                        return Ok(ReindexOutcome::Interrupted);
                    }

                    self.reindex_batch(operation_id, &operation.tags, batch)
                        .await?;

                    // Tags paused while the batch ran must not be checkpointed.
                    operation = run_activity(retry, "get_operation", operation_id, move || {
                        reindex.get_operation(operation_id)
                    })
                    .await?;
                    if operation.tags.is_empty() {
                        OrchestratorState::Cancelled
                    } else {
                        operation = self.checkpoint(operation_id, batch.start - 1).await?;
                        self.emit(WorkerEvent::BatchCheckpointed {
                            operation_id: operation_id.to_string(),
                            batch,
                            percent_complete: percent_complete(&operation),
                        });
                        match pending.pop_front() {
                            Some(next) => OrchestratorState::Reindexing(next),
                            None => OrchestratorState::resolve(&operation),
                        }
                    }
                }

                OrchestratorState::Completing => {
                    ready = run_activity(retry, "complete", operation_id, move || {
                        reindex.complete(operation_id)
                    })
                    .await?;
                    OrchestratorState::Completed
                }

                OrchestratorState::Completed => {
                    info!(
                        subsystem = "jobs",
                        component = "orchestrator",
                        op = "complete",
                        operation_id,
                        tag_count = ready.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Reindex operation completed"
                    );
                    return Ok(ReindexOutcome::Completed { tags: ready });
                }

                OrchestratorState::Cancelled => {
                    info!(
                        subsystem = "jobs",
                        component = "orchestrator",
                        operation_id,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Every tag paused, reindex operation cancelled"
                    );
                    return Ok(ReindexOutcome::Cancelled);
                }
            };
        }
    }

    /// Batches below the uncovered end, newest first, clipped to the floor.
    async fn plan_batches(
        &self,
        operation_id: &str,
        remaining: WatermarkRange,
    ) -> Result<Vec<WatermarkRange>> {
        let instances = self.stores.instances.as_ref();
        let (size, count) = (self.config.batch_size, self.config.batch_count);
        let batches = run_activity(
            self.config.retry,
            "get_instance_batches",
            operation_id,
            move || {
                instances.get_instance_batches(
                    size,
                    count,
                    IndexStatus::Created,
                    Some(remaining.end),
                )
            },
        )
        .await?;

        Ok(batches
            .into_iter()
            .filter(|b| b.end >= remaining.start)
            .map(|b| WatermarkRange {
                start: b.start.max(remaining.start),
                end: b.end,
            })
            .collect())
    }

    /// Reindex every instance of one batch, recording per-tag failures.
    async fn reindex_batch(
        &self,
        operation_id: &str,
        tags: &[TagDefinition],
        batch: WatermarkRange,
    ) -> Result<()> {
        let started = Instant::now();
        let retry = self.config.retry;
        let instances = self.stores.instances.as_ref();
        let reindexer = self.stores.reindexer.as_ref();

        let identifiers = run_activity(
            retry,
            "get_instance_identifiers_by_watermark_range",
            operation_id,
            move || {
                instances.get_instance_identifiers_by_watermark_range(batch, IndexStatus::Created)
            },
        )
        .await?;
        let instance_count = identifiers.len();

        let results: Vec<(VersionedInstanceIdentifier, Result<_>)> = stream::iter(identifiers)
            .map(|instance| async move {
                let target = &instance;
                let result = run_activity(retry, "reindex_instance", operation_id, move || {
                    reindexer.reindex_instance(tags, target)
                })
                .await;
                (instance, result)
            })
            .buffer_unordered(self.config.max_parallel_instances)
            .collect()
            .await;

        let mut failure_count = 0usize;
        for (instance, result) in results {
            match result {
                Ok(failures) => {
                    for failure in failures {
                        failure_count += 1;
                        warn!(
                            subsystem = "jobs",
                            component = "orchestrator",
                            operation_id,
                            tag_key = failure.tag_key,
                            watermark = instance.watermark,
                            error_code = failure.code.code(),
                            detail = %failure.detail,
                            "Instance value failed validation"
                        );
                        self.record_error(operation_id, failure.tag_key, &instance, failure.code)
                            .await?;
                    }
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    failure_count += 1;
                    warn!(
                        subsystem = "jobs",
                        component = "orchestrator",
                        operation_id,
                        watermark = instance.watermark,
                        error = %e,
                        "Instance could not be reindexed, recording it against every tag"
                    );
                    for tag in tags
                        .iter()
                        .filter(|t| t.status != ExtendedQueryTagStatus::Deleting)
                    {
                        self.record_error(
                            operation_id,
                            tag.key,
                            &instance,
                            ValidationErrorCode::InstanceReindexFailed,
                        )
                        .await?;
                    }
                }
            }
        }

        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "reindex_batch",
            operation_id,
            batch_start = batch.start,
            batch_end = batch.end,
            instance_count,
            failure_count,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch reindexed"
        );
        Ok(())
    }

    async fn record_error(
        &self,
        operation_id: &str,
        tag_key: TagKey,
        instance: &VersionedInstanceIdentifier,
        code: ValidationErrorCode,
    ) -> Result<()> {
        let errors = self.stores.errors.as_ref();
        let created = Utc::now();
        match run_activity(self.config.retry, "add_error", operation_id, move || {
            errors.add_error(tag_key, instance, code, created)
        })
        .await
        {
            Ok(_) => Ok(()),
            // Replayed batch, or tag deleted after being paused.
            Err(Error::AlreadyExists(_)) | Err(Error::ExtendedQueryTagNotFound(_)) => {
                debug!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    operation_id,
                    tag_key,
                    watermark = instance.watermark,
                    "Tag error already recorded or tag gone"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn checkpoint(&self, operation_id: &str, new_end: i64) -> Result<ReindexOperation> {
        let reindex = self.stores.reindex.as_ref();
        let operation = run_activity(self.config.retry, "update_progress", operation_id, move || {
            reindex.update_progress(operation_id, new_end)
        })
        .await?;
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "update_progress",
            operation_id,
            watermark = new_end,
            percent_complete = percent_complete(&operation),
            "Checkpointed reindex progress"
        );
        Ok(operation)
    }
}
