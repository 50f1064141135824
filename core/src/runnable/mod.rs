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

//! The per-job state machine:
//! `Created -> Initializing -> Running -> {Succeeded | Cancelled | Failed} -> CleanedUp`.
//!
//! Every failure inside initialization or merging is turned into a terminal
//! state here. The runnable always releases its "stopped" signal, after the
//! output file has been cleaned up or handed off and after the terminal
//! status has been reported.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::allocator::{OutputFile, OutputFileAllocatorRef};
use crate::cancel_checker::CancelChecker;
use crate::common::metrics::MetricsRef;
use crate::config::WorkerConfig;
use crate::coordinator::CancellationSourceRef;
use crate::error::{CompactionError, Result};
use crate::finalizer::OutputFinalizerRef;
use crate::holder::JobHolderRef;
use crate::job::{
    CompactionJob, CompactionState, CompactionStats, CompactionStatusUpdate, ExternalCompactionId,
};
use crate::merger::{FileMerger, MergeRequest, MergeStep, MergerFactoryRef};
use crate::reporter::StatusReporterRef;
use crate::volume::VolumeRef;

/// Turns a panic caught in a collaborator into an ordinary failure so the job
/// still goes through cleanup.
fn panicked(phase: &str, panic: Box<dyn Any + Send>) -> CompactionError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    CompactionError::Execution(format!("{phase} panicked: {message}"))
}

/// Collaborators shared by every job a worker runs.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<WorkerConfig>,
    pub holder: JobHolderRef,
    pub reporter: StatusReporterRef,
    pub cancellation_source: CancellationSourceRef,
    pub volume: VolumeRef,
    pub allocator: OutputFileAllocatorRef,
    pub merger_factory: MergerFactoryRef,
    pub finalizer: OutputFinalizerRef,
    pub metrics: MetricsRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnableState {
    Created,
    Initializing,
    Running,
    Succeeded,
    Cancelled,
    Failed,
    CleanedUp,
}

impl fmt::Display for RunnableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnableState::Created => "CREATED",
            RunnableState::Initializing => "INITIALIZING",
            RunnableState::Running => "RUNNING",
            RunnableState::Succeeded => "SUCCEEDED",
            RunnableState::Cancelled => "CANCELLED",
            RunnableState::Failed => "FAILED",
            RunnableState::CleanedUp => "CLEANED_UP",
        };
        f.write_str(name)
    }
}

/// What the executor learns once a job has stopped.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub external_compaction_id: ExternalCompactionId,
    /// One of the terminal states.
    pub state: CompactionState,
    /// Set when `state` is `Failed`.
    pub error: Option<Arc<CompactionError>>,
    pub stats: CompactionStats,
    /// Where the output lives after a successful handoff.
    pub output_path: Option<PathBuf>,
}

impl CompactionOutcome {
    pub fn is_success(&self) -> bool {
        self.state == CompactionState::Succeeded
    }
}

/// Receiving ends of the runnable's two single-use signals.
pub struct RunnableSignals {
    pub started: oneshot::Receiver<()>,
    pub stopped: oneshot::Receiver<CompactionOutcome>,
}

pub struct CompactionRunnable {
    job: Arc<CompactionJob>,
    ctx: WorkerContext,
    state: RunnableState,
    output: Option<OutputFile>,
    output_created: bool,
    stats: CompactionStats,
    started_tx: Option<oneshot::Sender<()>>,
    stopped_tx: Option<oneshot::Sender<CompactionOutcome>>,
}

impl CompactionRunnable {
    pub fn new(job: Arc<CompactionJob>, ctx: WorkerContext) -> (Self, RunnableSignals) {
        let (started_tx, started) = oneshot::channel();
        let (stopped_tx, stopped) = oneshot::channel();
        let runnable = Self {
            job,
            ctx,
            state: RunnableState::Created,
            output: None,
            output_created: false,
            stats: CompactionStats::default(),
            started_tx: Some(started_tx),
            stopped_tx: Some(stopped_tx),
        };
        (runnable, RunnableSignals { started, stopped })
    }

    pub fn state(&self) -> RunnableState {
        self.state
    }

    /// Drives the job to a terminal state and cleans up after it. The caller
    /// must have placed the job in the holder's slot; it is released here.
    pub async fn run(mut self) -> CompactionOutcome {
        let start = Instant::now();
        let ecid = self.job.external_compaction_id.clone();
        tracing::info!(
            ecid = %ecid,
            tablet = %self.job.tablet,
            files = self.job.files.len(),
            entries = self.job.input_entries(),
            "Starting compaction"
        );

        self.transition(RunnableState::Initializing);
        self.report(
            CompactionStatusUpdate::new(CompactionState::Started, "Compaction started")
                .with_entries_to_be_compacted(self.job.input_entries()),
        )
        .await;

        let initialized = AssertUnwindSafe(self.initialize())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panicked("initialization", panic)));
        let result = match initialized {
            Ok(merger) => {
                self.transition(RunnableState::Running);
                if let Some(started) = self.started_tx.take() {
                    let _ = started.send(());
                }
                let stop_checker = CancellationToken::new();
                let checker = self.cancel_checker().spawn(stop_checker.clone());
                let result = AssertUnwindSafe(self.merge(merger))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panicked("merge", panic)));
                stop_checker.cancel();
                if let Err(e) = checker.await {
                    tracing::warn!(ecid = %ecid, "Cancel checker exited abnormally: {}", e);
                }
                result
            }
            Err(e) => Err(e),
        };

        let outcome = self.finish(result).await;
        self.report_terminal(&outcome).await;

        self.ctx.holder.clear();
        self.transition(RunnableState::CleanedUp);

        let elapsed = start.elapsed();
        self.ctx
            .metrics
            .record_job(&self.ctx.config.worker_id, outcome.state, elapsed);
        if outcome.is_success() {
            self.ctx
                .metrics
                .record_entries_written(&self.ctx.config.worker_id, outcome.stats.entries_written);
        }
        tracing::info!(
            ecid = %ecid,
            state = %outcome.state,
            entries_written = outcome.stats.entries_written,
            "Compaction stopped after {:?}",
            elapsed
        );

        // Dropping an unsent started signal lets a waiting executor move on.
        self.started_tx.take();
        if let Some(stopped) = self.stopped_tx.take() {
            if stopped.send(outcome.clone()).is_err() {
                tracing::debug!(ecid = %ecid, "Nobody is waiting for the stopped signal");
            }
        }
        outcome
    }

    fn transition(&mut self, next: RunnableState) {
        tracing::debug!(
            ecid = %self.job.external_compaction_id,
            "Compaction {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    fn cancel_checker(&self) -> CancelChecker {
        CancelChecker::new(
            self.ctx.holder.clone(),
            self.ctx.cancellation_source.clone(),
            self.ctx.config.cancel_check_interval(),
            self.ctx.config.worker_id.clone(),
            self.ctx.metrics.clone(),
        )
    }

    async fn initialize(&mut self) -> Result<Box<dyn FileMerger>> {
        let max_input_files = self.ctx.config.max_input_files;
        if max_input_files > 0 && self.job.files.len() > max_input_files {
            return Err(CompactionError::TooManyFiles {
                tablet: self.job.tablet.to_string(),
            });
        }

        let output = self.ctx.allocator.allocate_output_path(&self.job).await?;
        self.output = Some(output.clone());

        self.ctx
            .volume
            .create_file(&output.tmp_path)
            .await
            .map_err(|e| {
                CompactionError::Allocation(format!(
                    "failed to create {}: {}",
                    output.tmp_path.display(),
                    e
                ))
            })?;
        self.output_created = true;
        tracing::debug!(
            ecid = %self.job.external_compaction_id,
            "Created output file {}",
            output.tmp_path.display()
        );

        self.ctx.merger_factory.create_merger(MergeRequest {
            job: self.job.clone(),
            output,
            volume: self.ctx.volume.clone(),
            cancel_check: self.ctx.holder.cancel_check(),
        })
    }

    async fn merge(&mut self, mut merger: Box<dyn FileMerger>) -> Result<CompactionStats> {
        let progress_interval = self.ctx.config.progress_report_interval();
        let mut last_progress = Instant::now();
        loop {
            if self.ctx.holder.is_cancelled() {
                return Err(CompactionError::Cancelled);
            }
            match merger.merge_increment().await? {
                MergeStep::Progress(stats) => {
                    self.stats = stats;
                    if last_progress.elapsed() >= progress_interval {
                        last_progress = Instant::now();
                        self.report_progress().await;
                    }
                }
                MergeStep::Finished(stats) => {
                    self.stats = stats;
                    return Ok(stats);
                }
                MergeStep::Cancelled => return Err(CompactionError::Cancelled),
            }
            // Gives the cancel checker a chance to run on a current-thread runtime.
            tokio::task::yield_now().await;
        }
    }

    /// Maps the merge result to a terminal state and deals with the output.
    async fn finish(&mut self, result: Result<CompactionStats>) -> CompactionOutcome {
        let ecid = self.job.external_compaction_id.clone();
        let mut output_path = None;
        let (state, error) = match result {
            Ok(_) => match AssertUnwindSafe(self.hand_off())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panicked("output handoff", panic)))
            {
                Ok(path) => {
                    output_path = Some(path);
                    (CompactionState::Succeeded, None)
                }
                Err(e) => (CompactionState::Failed, Some(e)),
            },
            Err(e) if e.is_cancellation() => (CompactionState::Cancelled, None),
            Err(e) => (CompactionState::Failed, Some(e)),
        };

        match state {
            CompactionState::Succeeded => self.transition(RunnableState::Succeeded),
            CompactionState::Cancelled => {
                tracing::info!(ecid = %ecid, "Compaction cancelled");
                self.transition(RunnableState::Cancelled);
                self.delete_output().await;
            }
            _ => {
                if let Some(e) = &error {
                    tracing::error!(
                        ecid = %ecid,
                        tablet = %self.job.tablet,
                        "Compaction failed: {}",
                        e
                    );
                }
                self.transition(RunnableState::Failed);
                self.delete_output().await;
            }
        }

        CompactionOutcome {
            external_compaction_id: ecid,
            state,
            error: error.map(Arc::new),
            stats: self.stats,
            output_path,
        }
    }

    async fn hand_off(&self) -> Result<PathBuf> {
        let output = self.output.as_ref().ok_or_else(|| {
            CompactionError::Execution("merge finished without an output file".to_owned())
        })?;
        self.ctx
            .finalizer
            .finalize(&self.job, output, &self.ctx.volume)
            .await
    }

    async fn delete_output(&mut self) {
        if !self.output_created {
            return;
        }
        let Some(output) = &self.output else {
            return;
        };
        match self.ctx.volume.delete_file(&output.tmp_path).await {
            Ok(()) => {
                self.output_created = false;
                tracing::debug!(
                    ecid = %self.job.external_compaction_id,
                    "Deleted output file {}",
                    output.tmp_path.display()
                );
            }
            Err(e) => tracing::warn!(
                ecid = %self.job.external_compaction_id,
                "Failed to delete output file {}: {}",
                output.tmp_path.display(),
                e
            ),
        }
    }

    async fn report_terminal(&self, outcome: &CompactionOutcome) {
        let update = match outcome.state {
            CompactionState::Succeeded => {
                CompactionStatusUpdate::new(CompactionState::Succeeded, "Compaction completed")
                    .with_stats(outcome.stats)
            }
            CompactionState::Cancelled => {
                CompactionStatusUpdate::new(CompactionState::Cancelled, "Compaction cancelled")
                    .with_stats(outcome.stats)
            }
            state => {
                let message = outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Compaction failed".to_owned());
                CompactionStatusUpdate::new(state, message).with_stats(outcome.stats)
            }
        };
        self.report(update).await;
    }

    /// Reports with the full retry budget. Exhaustion leaves the local state
    /// untouched.
    async fn report(&self, update: CompactionStatusUpdate) {
        let state = update.state;
        if let Err(e) = self
            .ctx
            .reporter
            .report(&self.job.external_compaction_id, update)
            .await
        {
            tracing::warn!(
                ecid = %self.job.external_compaction_id,
                state = %state,
                "Failed to report compaction status: {}",
                e
            );
        }
    }

    async fn report_progress(&self) {
        let update = CompactionStatusUpdate::new(
            CompactionState::InProgress,
            format!(
                "Compacted {} of {} entries",
                self.stats.entries_read,
                self.job.input_entries()
            ),
        )
        .with_entries_to_be_compacted(self.job.input_entries())
        .with_stats(self.stats);
        if let Err(e) = self
            .ctx
            .reporter
            .try_report(&self.job.external_compaction_id, update)
            .await
        {
            tracing::debug!(
                ecid = %self.job.external_compaction_id,
                "Dropped progress report: {}",
                e
            );
        }
    }
}
