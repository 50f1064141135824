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

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::common::metrics::MetricsRef;
use crate::coordinator::CancellationSourceRef;
use crate::holder::JobHolderRef;

/// Periodically asks the cancellation authority whether the running job is
/// still wanted and flags it in the [`JobHolder`](crate::holder::JobHolder)
/// when it is not.
///
/// The checker never touches the output file and never reports status. A
/// failed lookup is logged and retried on the next tick.
#[derive(Clone)]
pub struct CancelChecker {
    holder: JobHolderRef,
    source: CancellationSourceRef,
    period: Duration,
    worker_id: String,
    metrics: MetricsRef,
}

impl CancelChecker {
    pub fn new(
        holder: JobHolderRef,
        source: CancellationSourceRef,
        period: Duration,
        worker_id: impl Into<String>,
        metrics: MetricsRef,
    ) -> Self {
        Self {
            holder,
            source,
            period,
            worker_id: worker_id.into(),
            metrics,
        }
    }

    /// Runs one check. Returns true when this call flagged the running job.
    pub async fn check_once(&self) -> bool {
        let Some(job) = self.holder.current() else {
            return false;
        };
        if self.holder.is_cancelled() {
            return false;
        }

        match self.source.should_cancel(&job).await {
            Ok(true) => {
                let cancelled = self.holder.cancel_job(&job.external_compaction_id);
                if cancelled {
                    tracing::info!(
                        ecid = %job.external_compaction_id,
                        tablet = %job.tablet,
                        "Compaction is no longer wanted, cancelling"
                    );
                }
                cancelled
            }
            Ok(false) => false,
            Err(e) => {
                self.metrics.record_cancel_check_error(&self.worker_id);
                tracing::warn!(
                    ecid = %job.external_compaction_id,
                    "Cancel check failed, will retry in {:?}: {}",
                    self.period,
                    e
                );
                false
            }
        }
    }

    /// Ticks every period until `stop` is cancelled. The first check happens
    /// one full period after spawning. A lookup still in flight when `stop`
    /// fires is dropped.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = self.check_once() => {}
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::metrics::Metrics;
    use crate::coordinator::MemoryCoordinator;
    use crate::holder::JobHolder;
    use crate::job::{CompactionJob, InputFile, TabletId};

    fn job() -> Arc<CompactionJob> {
        Arc::new(CompactionJob::new(
            TabletId::whole_table("1"),
            vec![InputFile::new("/t/1/a.rf", 1, 1)],
        ))
    }

    fn checker(holder: &JobHolderRef, coordinator: &Arc<MemoryCoordinator>) -> CancelChecker {
        CancelChecker::new(
            holder.clone(),
            coordinator.clone(),
            Duration::from_secs(5),
            "w1",
            Arc::new(Metrics::noop()),
        )
    }

    #[tokio::test]
    async fn test_idle_checker_is_noop() {
        let holder = Arc::new(JobHolder::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let checker = checker(&holder, &coordinator);

        assert!(!checker.check_once().await);
        assert_eq!(coordinator.cancel_queries().await, 0);
        assert!(!holder.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_lookup_is_retried_next_tick() {
        let holder = Arc::new(JobHolder::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let running = job();
        holder.set_current(running.clone()).unwrap();
        coordinator.cancel(&running.external_compaction_id).await;
        coordinator.fail_next_cancel_queries(1).await;
        let checker = checker(&holder, &coordinator);

        assert!(!checker.check_once().await);
        assert!(!holder.is_cancelled());
        assert!(checker.check_once().await);
        assert!(holder.is_cancelled());
        assert_eq!(coordinator.cancel_queries().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_checker_ticks_at_period() {
        let holder = Arc::new(JobHolder::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let running = job();
        holder.set_current(running.clone()).unwrap();
        let stop = CancellationToken::new();
        let handle = checker(&holder, &coordinator).spawn(stop.clone());

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(coordinator.cancel_queries().await, 0);

        coordinator.cancel(&running.external_compaction_id).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(coordinator.cancel_queries().await, 1);
        assert!(holder.is_cancelled());

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_checker_ignores_other_jobs() {
        let holder = Arc::new(JobHolder::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        holder.set_current(job()).unwrap();
        coordinator.cancel(&job().external_compaction_id).await;
        let stop = CancellationToken::new();
        let handle = checker(&holder, &coordinator).spawn(stop.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(coordinator.cancel_queries().await, 3);
        assert!(!holder.is_cancelled());

        stop.cancel();
        handle.await.unwrap();
    }

    /// Cancellation authority that never answers.
    struct StalledSource;

    #[async_trait::async_trait]
    impl crate::coordinator::CancellationSource for StalledSource {
        async fn should_cancel(&self, _job: &CompactionJob) -> crate::error::Result<bool> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_lookup() {
        let holder = Arc::new(JobHolder::new());
        holder.set_current(job()).unwrap();
        let checker = CancelChecker::new(
            holder.clone(),
            Arc::new(StalledSource),
            Duration::from_millis(10),
            "w1",
            Arc::new(Metrics::noop()),
        );
        let stop = CancellationToken::new();
        let handle = checker.spawn(stop.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("checker did not stop")
            .unwrap();
        assert!(!holder.is_cancelled());
    }
}
