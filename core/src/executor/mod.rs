/*
 * Copyright 2025 tablet-compactor
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use mixtrics::metrics::BoxedRegistry;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::allocator::OutputFileAllocatorRef;
use crate::common::metrics::{Metrics, MetricsRef};
use crate::config::WorkerConfig;
use crate::coordinator::{CancellationSourceRef, CoordinatorClientRef};
use crate::error::{CompactionError, Result};
use crate::finalizer::{CoordinatorCommitFinalizer, OutputFinalizerRef};
use crate::holder::{JobHolder, JobHolderRef};
use crate::job::{
    CompactionJob, CompactionState, CompactionStats, CompactionStatusUpdate, ExternalCompactionId,
};
use crate::merger::{MergerFactoryRef, MergerType, create_merger_factory};
use crate::reporter::StatusReporter;
use crate::runnable::{CompactionOutcome, CompactionRunnable, WorkerContext};
use crate::volume::VolumeRef;

/// A stopped signal that any number of waiters can await.
type SharedOutcome = Shared<BoxFuture<'static, CompactionOutcome>>;

fn shared_outcome(
    ecid: ExternalCompactionId,
    holder: JobHolderRef,
    stopped: oneshot::Receiver<CompactionOutcome>,
) -> SharedOutcome {
    async move {
        match stopped.await {
            Ok(outcome) => outcome,
            Err(_) => {
                // The runnable's task died without reaching cleanup.
                tracing::error!(ecid = %ecid, "Compaction task terminated unexpectedly");
                holder.clear();
                CompactionOutcome {
                    external_compaction_id: ecid,
                    state: CompactionState::Failed,
                    error: Some(Arc::new(CompactionError::Execution(
                        "compaction task terminated unexpectedly".to_owned(),
                    ))),
                    stats: CompactionStats::default(),
                    output_path: None,
                }
            }
        }
    }
    .boxed()
    .shared()
}

/// Handle to a submitted job.
#[derive(Clone)]
pub struct JobHandle {
    external_compaction_id: ExternalCompactionId,
    started: bool,
    stopped: SharedOutcome,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("external_compaction_id", &self.external_compaction_id)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub fn external_compaction_id(&self) -> &ExternalCompactionId {
        &self.external_compaction_id
    }

    /// Whether the job reached `RUNNING`. False when initialization failed.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Waits for the job's stopped signal.
    pub async fn wait(&self) -> CompactionOutcome {
        self.stopped.clone().await
    }
}

/// Runs compaction jobs one at a time.
///
/// Jobs either come from [`CompactionExecutor::run`], which polls the
/// coordinator, or are handed in directly through
/// [`CompactionExecutor::submit`]. There is no internal queue: a job offered
/// while another one occupies the slot is rejected.
pub struct CompactionExecutor {
    ctx: WorkerContext,
    coordinator: CoordinatorClientRef,
    shutdown: CancellationToken,
    current: Mutex<Option<SharedOutcome>>,
}

impl CompactionExecutor {
    /// Creates a worker with the default concatenating merger, a finalizer
    /// that leaves the commit to the coordinator and no-op metrics.
    pub fn new(
        config: WorkerConfig,
        coordinator: CoordinatorClientRef,
        cancellation_source: CancellationSourceRef,
        volume: VolumeRef,
        allocator: OutputFileAllocatorRef,
    ) -> Result<Self> {
        config.validate()?;
        let metrics: MetricsRef = Arc::new(Metrics::noop());
        let reporter = StatusReporter::new(coordinator.clone(), config.status_retry.clone())
            .with_metrics(metrics.clone());
        let ctx = WorkerContext {
            config: Arc::new(config),
            holder: Arc::new(JobHolder::new()),
            reporter: Arc::new(reporter),
            cancellation_source,
            volume,
            allocator,
            merger_factory: create_merger_factory(MergerType::default()),
            finalizer: Arc::new(CoordinatorCommitFinalizer),
            metrics,
        };
        Ok(Self {
            ctx,
            coordinator,
            shutdown: CancellationToken::new(),
            current: Mutex::new(None),
        })
    }

    pub fn with_merger_factory(mut self, merger_factory: MergerFactoryRef) -> Self {
        self.ctx.merger_factory = merger_factory;
        self
    }

    pub fn with_finalizer(mut self, finalizer: OutputFinalizerRef) -> Self {
        self.ctx.finalizer = finalizer;
        self
    }

    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        let metrics: MetricsRef = Arc::new(Metrics::new(registry));
        let reporter = StatusReporter::new(
            self.coordinator.clone(),
            self.ctx.config.status_retry.clone(),
        )
        .with_metrics(metrics.clone());
        self.ctx.reporter = Arc::new(reporter);
        self.ctx.metrics = metrics;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.ctx.config.worker_id
    }

    pub fn is_busy(&self) -> bool {
        self.ctx.holder.is_occupied()
    }

    /// Starts `job` on its own task and returns once it is running, or once
    /// it has already stopped because initialization failed.
    pub async fn submit(&self, job: CompactionJob) -> Result<JobHandle> {
        let job = Arc::new(job);
        let ecid = job.external_compaction_id.clone();

        let (started, stopped) = {
            let mut current = self.current.lock();
            if self.shutdown.is_cancelled() {
                return Err(CompactionError::ShuttingDown);
            }
            self.ctx.holder.set_current(job.clone())?;

            let (runnable, signals) = CompactionRunnable::new(job, self.ctx.clone());
            let stopped = shared_outcome(ecid.clone(), self.ctx.holder.clone(), signals.stopped);
            tokio::spawn(runnable.run());
            *current = Some(stopped.clone());
            (signals.started, stopped)
        };

        // The sender is dropped without a value when the job never reached RUNNING.
        let started = started.await.is_ok();
        if !started {
            tracing::debug!(ecid = %ecid, "Compaction stopped before running");
        }
        Ok(JobHandle {
            external_compaction_id: ecid,
            started,
            stopped,
        })
    }

    /// Runs `job` to completion.
    pub async fn run_job(&self, job: CompactionJob) -> Result<CompactionOutcome> {
        let handle = self.submit(job).await?;
        Ok(handle.wait().await)
    }

    /// Cancels the running job if it is `ecid`.
    pub fn cancel(&self, ecid: &ExternalCompactionId) -> bool {
        self.ctx.holder.cancel_job(ecid)
    }

    /// Polls the coordinator for work until shutdown is requested. Only a
    /// programming error, such as a job slot found occupied, ends the loop
    /// early.
    pub async fn run(&self) -> Result<()> {
        let worker_id = self.ctx.config.worker_id.clone();
        let initial_idle = self.ctx.config.idle_poll_interval();
        let max_idle = self.ctx.config.max_idle_poll_interval();
        let mut idle = initial_idle;
        tracing::info!(worker_id = %worker_id, "Compaction worker started");

        while !self.shutdown.is_cancelled() {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.coordinator.get_compaction_job(&worker_id) => next,
            };

            let delay = match next {
                Ok(Some(job)) => {
                    idle = initial_idle;
                    tracing::debug!(
                        worker_id = %worker_id,
                        ecid = %job.external_compaction_id,
                        "Received compaction job"
                    );
                    if self.run_polled_job(job).await? {
                        continue;
                    }
                    break;
                }
                Ok(None) => {
                    tracing::debug!(
                        worker_id = %worker_id,
                        "No compaction work, sleeping {:?}",
                        idle
                    );
                    next_idle(&mut idle, max_idle)
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, "Failed to get compaction job: {}", e);
                    next_idle(&mut idle, max_idle)
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(worker_id = %worker_id, "Compaction worker stopped");
        Ok(())
    }

    /// Runs a job handed out by the coordinator. Returns `false` when the
    /// worker was already shutting down; the job is then reported as
    /// cancelled so the coordinator can hand it to another worker.
    async fn run_polled_job(&self, job: CompactionJob) -> Result<bool> {
        let ecid = job.external_compaction_id.clone();
        match self.run_job(job).await {
            Ok(_) => Ok(true),
            Err(CompactionError::ShuttingDown) => {
                tracing::warn!(ecid = %ecid, "Worker shutting down, declining compaction job");
                let update =
                    CompactionStatusUpdate::new(CompactionState::Cancelled, "Worker shutting down");
                if let Err(e) = self.ctx.reporter.report(&ecid, update).await {
                    tracing::warn!(ecid = %ecid, "Failed to report declined compaction: {}", e);
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Stops accepting jobs, cancels the running one and waits until it has
    /// cleaned up.
    pub async fn shutdown(&self) {
        let running = {
            let current = self.current.lock();
            self.shutdown.cancel();
            current.clone()
        };

        if self.ctx.holder.cancel() {
            tracing::info!(
                worker_id = %self.ctx.config.worker_id,
                "Cancelling running compaction for shutdown"
            );
        }
        if let Some(stopped) = running {
            let outcome = stopped.await;
            tracing::debug!(
                ecid = %outcome.external_compaction_id,
                state = %outcome.state,
                "Last compaction stopped"
            );
        }
    }
}

/// Returns the current idle delay and doubles it for next time.
fn next_idle(idle: &mut Duration, max_idle: Duration) -> Duration {
    let delay = *idle;
    *idle = (*idle * 2).min(max_idle);
    delay
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::allocator::TabletFileAllocator;
    use crate::common::InMemoryMetricsRegistry;
    use crate::config::WorkerConfigBuilder;
    use crate::coordinator::{CoordinatorClient, MemoryCoordinator};
    use crate::job::{InputFile, TabletId};
    use crate::merger::MockBehavior;
    use crate::volume::{MemoryVolume, Volume};

    fn config() -> WorkerConfig {
        WorkerConfigBuilder::default()
            .worker_id("w1")
            .cancel_check_interval_ms(20)
            .idle_poll_interval_ms(10)
            .max_idle_poll_interval_ms(40)
            .build()
            .unwrap()
    }

    fn executor(
        coordinator: Arc<MemoryCoordinator>,
        volume: Arc<MemoryVolume>,
        behavior: MockBehavior,
    ) -> CompactionExecutor {
        CompactionExecutor::new(
            config(),
            coordinator.clone(),
            coordinator,
            volume,
            Arc::new(TabletFileAllocator::new("/tables")),
        )
        .unwrap()
        .with_merger_factory(create_merger_factory(MergerType::Mock(behavior)))
    }

    fn job() -> CompactionJob {
        CompactionJob::new(
            TabletId::new("2", Some("m"), None),
            vec![
                InputFile::new("/tables/2/t-1/F1.rf", 10, 4),
                InputFile::new("/tables/2/t-1/F2.rf", 10, 4),
            ],
        )
    }

    fn never_finish() -> MockBehavior {
        MockBehavior::NeverFinish {
            pause: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_second_job_is_rejected() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let volume = Arc::new(MemoryVolume::new());
        let executor = executor(coordinator.clone(), volume.clone(), never_finish());

        let first = executor.submit(job()).await.unwrap();
        assert!(first.started());
        assert!(executor.is_busy());

        let second = job();
        let err = executor.submit(second.clone()).await.unwrap_err();
        assert!(matches!(err, CompactionError::JobSlotOccupied { .. }));
        assert!(
            coordinator
                .states_for(&second.external_compaction_id)
                .await
                .is_empty()
        );

        assert!(!executor.cancel(&second.external_compaction_id));
        assert!(executor.cancel(first.external_compaction_id()));
        let outcome = first.wait().await;
        assert_eq!(outcome.state, CompactionState::Cancelled);
        assert!(!executor.is_busy());

        // The slot is free again.
        let third = executor.submit(job()).await.unwrap();
        executor.cancel(third.external_compaction_id());
        assert_eq!(third.wait().await.state, CompactionState::Cancelled);
        assert!(volume.paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_job() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let volume = Arc::new(MemoryVolume::new());
        let executor = executor(coordinator.clone(), volume.clone(), never_finish());

        let handle = executor.submit(job()).await.unwrap();
        executor.shutdown().await;

        // Shutdown returned only after the job had stopped.
        assert!(!executor.is_busy());
        let outcome = handle.wait().await;
        assert_eq!(outcome.state, CompactionState::Cancelled);
        assert!(volume.paths().await.is_empty());
        assert_eq!(
            coordinator
                .lifecycle_for(handle.external_compaction_id())
                .await,
            vec![CompactionState::Started, CompactionState::Cancelled]
        );

        let err = executor.submit(job()).await.unwrap_err();
        assert!(matches!(err, CompactionError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_failed_initialization_returns_stopped_handle() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let volume = Arc::new(MemoryVolume::new());
        let executor = executor(coordinator, volume, MockBehavior::FailToCreate);

        let handle = executor.submit(job()).await.unwrap();
        assert!(!handle.started());
        let outcome = handle.wait().await;
        assert_eq!(outcome.state, CompactionState::Failed);
        assert!(outcome.error.is_some());
        assert!(!executor.is_busy());
    }

    #[tokio::test]
    async fn test_run_loop_processes_queued_jobs() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let volume = Arc::new(MemoryVolume::new());
        let first = job();
        let second = job();
        coordinator.add_job(first.clone()).await;
        coordinator.add_job(second.clone()).await;
        let executor = Arc::new(executor(
            coordinator.clone(),
            volume.clone(),
            MockBehavior::Complete { increments: 2 },
        ));

        let worker = executor.clone();
        let run = tokio::spawn(async move { worker.run().await });

        for job in [&first, &second] {
            let ecid = &job.external_compaction_id;
            while coordinator.lifecycle_for(ecid).await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(
                coordinator.lifecycle_for(ecid).await,
                vec![CompactionState::Started, CompactionState::Succeeded]
            );
        }
        assert_eq!(coordinator.pending_jobs().await, 0);
        assert_eq!(volume.paths().await.len(), 2);

        executor.shutdown().await;
        run.await.unwrap().unwrap();
    }

    /// Counts polls and never has work.
    #[derive(Default)]
    struct IdleCoordinator {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl CoordinatorClient for IdleCoordinator {
        async fn get_compaction_job(&self, _worker_id: &str) -> Result<Option<CompactionJob>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn update_compaction_status(
            &self,
            _ecid: &ExternalCompactionId,
            _update: &CompactionStatusUpdate,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_polling_backs_off() {
        let coordinator = Arc::new(IdleCoordinator::default());
        let executor = Arc::new(
            CompactionExecutor::new(
                WorkerConfigBuilder::default()
                    .worker_id("w1")
                    .idle_poll_interval_ms(1_000)
                    .max_idle_poll_interval_ms(8_000)
                    .build()
                    .unwrap(),
                coordinator.clone(),
                Arc::new(MemoryCoordinator::new()),
                Arc::new(MemoryVolume::new()),
                Arc::new(TabletFileAllocator::new("/tables")),
            )
            .unwrap(),
        );

        let worker = executor.clone();
        let run = tokio::spawn(async move { worker.run().await });

        // Polls at 0s, 1s, 3s, 7s, 15s, 23s.
        tokio::time::sleep(Duration::from_millis(16_000)).await;
        assert_eq!(coordinator.polls.load(Ordering::SeqCst), 5);
        tokio::time::sleep(Duration::from_millis(8_000)).await;
        assert_eq!(coordinator.polls.load(Ordering::SeqCst), 6);

        executor.shutdown().await;
        run.await.unwrap().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let config = WorkerConfigBuilder::default()
            .cancel_check_interval_ms(0)
            .build()
            .unwrap();
        let result = CompactionExecutor::new(
            config,
            coordinator.clone(),
            coordinator,
            Arc::new(MemoryVolume::new()),
            Arc::new(TabletFileAllocator::new("/tables")),
        );
        assert!(matches!(result, Err(CompactionError::Config(_))));
    }

    #[tokio::test]
    async fn test_job_received_during_shutdown_is_reported_cancelled() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let volume = Arc::new(MemoryVolume::new());
        let executor = executor(coordinator.clone(), volume.clone(), never_finish());
        executor.shutdown().await;

        let late = job();
        assert!(!executor.run_polled_job(late.clone()).await.unwrap());
        assert_eq!(
            coordinator.states_for(&late.external_compaction_id).await,
            vec![CompactionState::Cancelled]
        );
        assert!(volume.paths().await.is_empty());
        assert!(!executor.is_busy());
    }

    #[tokio::test]
    async fn test_metrics_reach_injected_registry() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let volume = Arc::new(MemoryVolume::new());
        let registry = InMemoryMetricsRegistry::new();
        let executor = executor(coordinator, volume, MockBehavior::Complete { increments: 2 })
            .with_metrics_registry(Box::new(registry.clone()));

        let outcome = executor.run_job(job()).await.unwrap();
        assert!(outcome.is_success());

        let labels = [("worker_id", "w1"), ("state", "SUCCEEDED")];
        assert_eq!(registry.value("tablet_compactor_job_counter", &labels), Some(1.0));
        assert_eq!(registry.value("tablet_compactor_job_duration_count", &labels), Some(1.0));
        assert_eq!(
            registry.value("tablet_compactor_entries_written", &[("worker_id", "w1")]),
            Some(2.0)
        );
        assert_eq!(
            registry.value("tablet_compactor_status_report_attempts", &[("state", "STARTED")]),
            Some(1.0)
        );
    }
}
