//! Reindex worker host.
//!
//! The worker owns every running orchestration. Operations are started
//! through a [`ReindexClient`] and tracked in a `JoinSet` until they finish.
//! On start and then every poll interval the worker picks up operations that
//! still have processing tags but no running task, such as failed ones or
//! ones prepared by another process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use dicom_core::{defaults, Error, ReindexOperation, Result, TagKey, WatermarkRange};

use crate::activity::run_activity;
use crate::config::ReindexConfig;
use crate::orchestrator::{ReindexOrchestrator, ReindexOutcome, ReindexStores};

/// Configuration for the reindex worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether to run orchestrations at all.
    pub enabled: bool,
    /// Resume operations that still have processing tags at startup.
    pub resume_on_start: bool,
    /// Time running orchestrations get to reach a checkpoint on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Interval between scans for active operations; 0 disables polling.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resume_on_start: true,
            shutdown_timeout_secs: defaults::WORKER_SHUTDOWN_TIMEOUT_SECS,
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REINDEX_WORKER_ENABLED` | `true` | Enable/disable orchestration |
    /// | `REINDEX_RESUME_ON_START` | `true` | Resume interrupted operations |
    /// | `REINDEX_SHUTDOWN_TIMEOUT_SECS` | `30` | Graceful shutdown window |
    /// | `REINDEX_POLL_INTERVAL_MS` | `5000` | Scan for unowned active operations |
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true)
        };
        let shutdown_timeout_secs = std::env::var("REINDEX_SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::WORKER_SHUTDOWN_TIMEOUT_SECS);
        let poll_interval_ms = std::env::var("REINDEX_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::WORKER_POLL_INTERVAL_MS);

        Self {
            enabled: flag("REINDEX_WORKER_ENABLED"),
            resume_on_start: flag("REINDEX_RESUME_ON_START"),
            shutdown_timeout_secs,
            poll_interval_ms,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_resume_on_start(mut self, resume: bool) -> Self {
        self.resume_on_start = resume;
        self
    }

    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }
}

/// Event emitted by the reindex worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// An orchestration started or resumed.
    OperationStarted { operation_id: String },
    /// A batch was reindexed and its progress persisted.
    BatchCheckpointed {
        operation_id: String,
        batch: WatermarkRange,
        percent_complete: u8,
    },
    /// Every tag of the operation is Ready.
    OperationCompleted {
        operation_id: String,
        tag_keys: Vec<TagKey>,
    },
    /// Every tag was paused out of the operation.
    OperationCancelled { operation_id: String },
    /// Stopped at a checkpoint for shutdown; resumes on next start.
    OperationInterrupted { operation_id: String },
    /// The orchestration failed; the operation stays resumable.
    OperationFailed { operation_id: String, error: String },
    /// Worker stopped.
    WorkerStopped,
}

enum WorkerCommand {
    Start {
        operation_id: String,
        tag_keys: Vec<TagKey>,
        reply: oneshot::Sender<Result<ReindexOperation>>,
    },
}

/// Cloneable handle for starting reindex operations on a running worker.
#[derive(Clone)]
pub struct ReindexClient {
    command_tx: mpsc::Sender<WorkerCommand>,
}

impl ReindexClient {
    /// Bind `tag_keys` to `operation_id` and run it in the background.
    ///
    /// Returns once the tags are bound, so binding conflicts reach the caller.
    pub async fn start_operation(
        &self,
        operation_id: &str,
        tag_keys: Vec<TagKey>,
    ) -> Result<ReindexOperation> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(WorkerCommand::Start {
                operation_id: operation_id.to_string(),
                tag_keys,
                reply,
            })
            .await
            .map_err(|_| Error::Internal("Reindex worker is not running".into()))?;
        response
            .await
            .map_err(|_| Error::Internal("Reindex worker dropped the request".into()))?
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    client: ReindexClient,
    shutdown_tx: watch::Sender<bool>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn client(&self) -> ReindexClient {
        self.client.clone()
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Signal shutdown and wait until every orchestration has stopped.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Reindex worker task failed: {}", e)))
    }
}

type RunningSet = Arc<Mutex<HashSet<String>>>;

/// Removes an operation from the running set when its task ends or unwinds.
struct RunningGuard {
    running: RunningSet,
    operation_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.operation_id);
    }
}

/// Worker that hosts reindex orchestrations.
pub struct ReindexWorker {
    stores: ReindexStores,
    config: WorkerConfig,
    reindex_config: ReindexConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
    running: RunningSet,
}

impl ReindexWorker {
    pub fn new(stores: ReindexStores, config: WorkerConfig, reindex_config: ReindexConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::WORKER_EVENT_CAPACITY);
        Self {
            stores,
            config,
            reindex_config,
            event_tx,
            running: RunningSet::default(),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(command_rx, shutdown_rx).await;
        });

        WorkerHandle {
            client: ReindexClient { command_tx },
            shutdown_tx,
            event_rx,
            task,
        }
    }

    #[instrument(skip_all)]
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<WorkerCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        if !self.config.enabled {
            info!("Reindex worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            resume_on_start = self.config.resume_on_start,
            poll_interval_ms = self.config.poll_interval_ms,
            "Reindex worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let mut tasks = JoinSet::new();
        if self.config.resume_on_start {
            self.resume_active(&mut tasks, &shutdown_rx).await;
        }

        let mut poll = (self.config.poll_interval_ms > 0).then(|| {
            let period = Duration::from_millis(self.config.poll_interval_ms);
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Reindex worker received shutdown signal");
                    break;
                }
                command = command_rx.recv() => match command {
                    Some(WorkerCommand::Start { operation_id, tag_keys, reply }) => {
                        let prepared = self.prepare(&operation_id, &tag_keys).await;
                        let accepted = prepared.is_ok();
                        let _ = reply.send(prepared);
                        if accepted && !self.is_running(&operation_id) {
                            self.spawn(&mut tasks, operation_id, tag_keys, &shutdown_rx);
                        }
                    }
                    None => {
                        debug!("All reindex clients dropped");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = ?e, "Reindex orchestration panicked");
                    }
                }
                _ = next_poll(&mut poll) => {
                    self.resume_active(&mut tasks, &shutdown_rx).await;
                }
            }
        }

        // Orchestrations watch the same signal and stop at their next batch.
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = ?e, "Reindex orchestration panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout_secs = self.config.shutdown_timeout_secs,
                "Orchestrations did not stop in time, aborting"
            );
            tasks.shutdown().await;
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Reindex worker stopped");
    }

    async fn prepare(&self, operation_id: &str, tag_keys: &[TagKey]) -> Result<ReindexOperation> {
        let reindex = self.stores.reindex.as_ref();
        run_activity(self.reindex_config.retry, "prepare", operation_id, move || {
            reindex.prepare(tag_keys, operation_id)
        })
        .await
    }

    fn is_running(&self, operation_id: &str) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.contains(operation_id)
    }

    /// Restart every operation that still has processing tags and no task.
    async fn resume_active(&self, tasks: &mut JoinSet<()>, shutdown_rx: &watch::Receiver<bool>) {
        let reindex = self.stores.reindex.as_ref();
        let retry = self.reindex_config.retry;
        let active = match run_activity(retry, "list_active_operations", "", move || {
            reindex.list_active_operations()
        })
        .await
        {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "Failed to list active reindex operations");
                return;
            }
        };

        for operation_id in active {
            if self.is_running(&operation_id) {
                continue;
            }
            match reindex.get_operation(&operation_id).await {
                Ok(operation) => {
                    info!(
                        subsystem = "jobs",
                        component = "worker",
                        operation_id = %operation_id,
                        tag_count = operation.tags.len(),
                        "Resuming reindex operation"
                    );
                    self.spawn(tasks, operation_id, operation.tag_keys(), shutdown_rx);
                }
                Err(e) => {
                    error!(
                        operation_id = %operation_id,
                        error = %e,
                        "Failed to load reindex operation"
                    );
                }
            }
        }
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<()>,
        operation_id: String,
        tag_keys: Vec<TagKey>,
        shutdown_rx: &watch::Receiver<bool>,
    ) {
        let orchestrator =
            ReindexOrchestrator::new(self.stores.clone(), self.reindex_config.clone())
                .with_events(self.event_tx.clone())
                .with_shutdown(shutdown_rx.clone());
        let event_tx = self.event_tx.clone();

        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation_id.clone());
        let guard = RunningGuard {
            running: self.running.clone(),
            operation_id: operation_id.clone(),
        };

        let _ = event_tx.send(WorkerEvent::OperationStarted {
            operation_id: operation_id.clone(),
        });
        tasks.spawn(async move {
            let _guard = guard;
            let event = match orchestrator.run(&operation_id, &tag_keys).await {
                Ok(ReindexOutcome::Completed { tags }) => WorkerEvent::OperationCompleted {
                    operation_id,
                    tag_keys: tags.iter().map(|t| t.key).collect(),
                },
                Ok(ReindexOutcome::Cancelled) => WorkerEvent::OperationCancelled { operation_id },
                Ok(ReindexOutcome::Interrupted) => {
                    WorkerEvent::OperationInterrupted { operation_id }
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "worker",
                        operation_id = %operation_id,
                        error = %e,
                        "Reindex operation failed"
                    );
                    WorkerEvent::OperationFailed {
                        operation_id,
                        error: e.to_string(),
                    }
                }
            };
            let _ = event_tx.send(event);
        });
    }
}

/// Resolves on the next poll tick, or never when polling is disabled.
async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Builder for creating a reindex worker.
pub struct WorkerBuilder {
    stores: ReindexStores,
    config: WorkerConfig,
    reindex_config: ReindexConfig,
}

impl WorkerBuilder {
    pub fn new(stores: ReindexStores) -> Self {
        Self {
            stores,
            config: WorkerConfig::default(),
            reindex_config: ReindexConfig::default(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the orchestration configuration.
    pub fn with_reindex_config(mut self, config: ReindexConfig) -> Self {
        self.reindex_config = config;
        self
    }

    pub fn build(self) -> ReindexWorker {
        ReindexWorker::new(self.stores, self.config, self.reindex_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::mock::InMemoryStore;
    use dicom_core::{ExtendedQueryTagStatus, ReindexStateStore};

    use crate::test_support::{add_sex_tag, config, seed, stores};

    async fn wait_for<F>(events: &mut broadcast::Receiver<WorkerEvent>, mut matches: F) -> WorkerEvent
    where
        F: FnMut(&WorkerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("event within timeout")
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert!(config.enabled);
        assert!(config.resume_on_start);
        assert_eq!(config.shutdown_timeout_secs, 30);
        assert_eq!(config.poll_interval_ms, 5_000);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_enabled(false)
            .with_resume_on_start(false)
            .with_shutdown_timeout(5)
            .with_poll_interval(0);
        assert!(!config.enabled);
        assert!(!config.resume_on_start);
        assert_eq!(config.shutdown_timeout_secs, 5);
        assert_eq!(config.poll_interval_ms, 0);
    }

    #[tokio::test]
    async fn test_started_operation_runs_to_completion() {
        let store = InMemoryStore::new();
        seed(&store, 10);
        let key = add_sex_tag(&store).await;

        let handle = WorkerBuilder::new(stores(&store))
            .with_reindex_config(config())
            .build()
            .start();
        let mut events = handle.events();

        let operation = handle
            .client()
            .start_operation("op-1", vec![key])
            .await
            .unwrap();
        assert_eq!(operation.remaining, Some(WatermarkRange { start: 1, end: 10 }));

        let done = wait_for(&mut events, |e| {
            matches!(e, WorkerEvent::OperationCompleted { .. })
        })
        .await;
        assert_eq!(
            done,
            WorkerEvent::OperationCompleted {
                operation_id: "op-1".to_string(),
                tag_keys: vec![key],
            }
        );
        assert_eq!(
            store.tag(key).unwrap().status,
            ExtendedQueryTagStatus::Ready
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_binding_conflict_reaches_the_caller() {
        let store = InMemoryStore::new();
        seed(&store, 3);
        let key = add_sex_tag(&store).await;
        store.prepare(&[key], "op-other").await.unwrap();

        let handle = WorkerBuilder::new(stores(&store))
            .with_config(WorkerConfig::default().with_resume_on_start(false))
            .with_reindex_config(config())
            .build()
            .start();

        let err = handle
            .client()
            .start_operation("op-1", vec![key])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_operation_resumes_on_start() {
        let store = InMemoryStore::new();
        seed(&store, 6);
        let key = add_sex_tag(&store).await;
        store.prepare(&[key], "op-1").await.unwrap();
        store.update_progress("op-1", 2).await.unwrap();

        let worker = WorkerBuilder::new(stores(&store))
            .with_reindex_config(config())
            .build();
        let mut events = worker.events();
        let handle = worker.start();

        wait_for(&mut events, |e| {
            matches!(e, WorkerEvent::OperationCompleted { operation_id, .. } if operation_id == "op-1")
        })
        .await;
        assert_eq!(store.index_write_count(), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_operation_is_picked_up_by_next_poll() {
        let store = InMemoryStore::new();
        seed(&store, 4);
        let key = add_sex_tag(&store).await;

        let handle = WorkerBuilder::new(stores(&store))
            .with_config(WorkerConfig::default().with_poll_interval(20))
            .with_reindex_config(config())
            .build()
            .start();
        let mut events = handle.events();

        // Exhausts the three attempts of the first run.
        store.fail_next("get_instance_batches", 3);
        handle
            .client()
            .start_operation("op-1", vec![key])
            .await
            .unwrap();

        wait_for(&mut events, |e| {
            matches!(e, WorkerEvent::OperationFailed { operation_id, .. } if operation_id == "op-1")
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, WorkerEvent::OperationCompleted { operation_id, .. } if operation_id == "op-1")
        })
        .await;
        assert_eq!(
            store.tag(key).unwrap().status,
            ExtendedQueryTagStatus::Ready
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operation_prepared_elsewhere_is_picked_up() {
        let store = InMemoryStore::new();
        seed(&store, 3);
        let key = add_sex_tag(&store).await;

        let handle = WorkerBuilder::new(stores(&store))
            .with_config(
                WorkerConfig::default()
                    .with_resume_on_start(false)
                    .with_poll_interval(20),
            )
            .with_reindex_config(config())
            .build()
            .start();
        let mut events = handle.events();
        store.prepare(&[key], "op-web").await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, WorkerEvent::OperationCompleted { operation_id, .. } if operation_id == "op-web")
        })
        .await;
        assert_eq!(store.index_values(key).len(), 3);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_worker_rejects_operations() {
        let store = InMemoryStore::new();
        let key = add_sex_tag(&store).await;

        let handle = WorkerBuilder::new(stores(&store))
            .with_config(WorkerConfig::default().with_enabled(false))
            .build()
            .start();

        let err = handle
            .client()
            .start_operation("op-1", vec![key])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_emits_stopped() {
        let store = InMemoryStore::new();
        let worker = WorkerBuilder::new(stores(&store)).build();
        let mut events = worker.events();
        let handle = worker.start();

        wait_for(&mut events, |e| *e == WorkerEvent::WorkerStarted).await;
        handle.shutdown().await.unwrap();
        wait_for(&mut events, |e| *e == WorkerEvent::WorkerStopped).await;
    }
}
