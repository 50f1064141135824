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

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CancellationSource, CoordinatorClient};
use crate::error::{CompactionError, Result};
use crate::job::{CompactionJob, CompactionState, CompactionStatusUpdate, ExternalCompactionId};

#[derive(Debug, Default)]
struct CoordinatorState {
    queue: VecDeque<CompactionJob>,
    updates: Vec<(ExternalCompactionId, CompactionStatusUpdate)>,
    cancelled: HashSet<ExternalCompactionId>,
    status_calls: usize,
    status_failures_left: usize,
    status_always_fails: bool,
    cancel_queries: usize,
    cancel_query_failures_left: usize,
}

/// In-process coordinator holding a job queue, every status update it
/// accepted, and a set of jobs it wants cancelled. Transport failures can be
/// injected for both status updates and cancellation queries.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    state: Mutex<CoordinatorState>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_job(&self, job: CompactionJob) {
        self.state.lock().await.queue.push_back(job);
    }

    pub async fn pending_jobs(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Marks a job as no longer wanted; the next cancel check will see it.
    pub async fn cancel(&self, ecid: &ExternalCompactionId) {
        self.state.lock().await.cancelled.insert(ecid.clone());
    }

    pub async fn fail_next_status_updates(&self, count: usize) {
        self.state.lock().await.status_failures_left = count;
    }

    pub async fn fail_all_status_updates(&self, fail: bool) {
        self.state.lock().await.status_always_fails = fail;
    }

    pub async fn fail_next_cancel_queries(&self, count: usize) {
        self.state.lock().await.cancel_query_failures_left = count;
    }

    /// Number of status update calls received, including failed ones.
    pub async fn status_calls(&self) -> usize {
        self.state.lock().await.status_calls
    }

    pub async fn cancel_queries(&self) -> usize {
        self.state.lock().await.cancel_queries
    }

    pub async fn updates(&self) -> Vec<(ExternalCompactionId, CompactionStatusUpdate)> {
        self.state.lock().await.updates.clone()
    }

    /// Accepted states for one job, in arrival order.
    pub async fn states_for(&self, ecid: &ExternalCompactionId) -> Vec<CompactionState> {
        self.state
            .lock()
            .await
            .updates
            .iter()
            .filter(|(id, _)| id == ecid)
            .map(|(_, update)| update.state)
            .collect()
    }

    /// Like [`Self::states_for`] without the `IN_PROGRESS` noise.
    pub async fn lifecycle_for(&self, ecid: &ExternalCompactionId) -> Vec<CompactionState> {
        self.states_for(ecid)
            .await
            .into_iter()
            .filter(|state| *state != CompactionState::InProgress)
            .collect()
    }
}

#[async_trait]
impl CoordinatorClient for MemoryCoordinator {
    async fn get_compaction_job(&self, _worker_id: &str) -> Result<Option<CompactionJob>> {
        Ok(self.state.lock().await.queue.pop_front())
    }

    async fn update_compaction_status(
        &self,
        ecid: &ExternalCompactionId,
        update: &CompactionStatusUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.status_calls += 1;
        if state.status_always_fails {
            return Err(CompactionError::Transport(
                "coordinator unavailable".to_owned(),
            ));
        }
        if state.status_failures_left > 0 {
            state.status_failures_left -= 1;
            return Err(CompactionError::Transport("connection reset".to_owned()));
        }
        state.updates.push((ecid.clone(), update.clone()));
        Ok(())
    }
}

#[async_trait]
impl CancellationSource for MemoryCoordinator {
    async fn should_cancel(&self, job: &CompactionJob) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.cancel_queries += 1;
        if state.cancel_query_failures_left > 0 {
            state.cancel_query_failures_left -= 1;
            return Err(CompactionError::Transport(
                "lease lookup timed out".to_owned(),
            ));
        }
        Ok(state.cancelled.contains(&job.external_compaction_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{InputFile, TabletId};

    fn job() -> CompactionJob {
        CompactionJob::new(
            TabletId::whole_table("1"),
            vec![InputFile::new("/t/1/a.rf", 1, 1)],
        )
    }

    #[tokio::test]
    async fn test_jobs_are_handed_out_in_order() {
        let coordinator = MemoryCoordinator::new();
        let first = job();
        let second = job();
        coordinator.add_job(first.clone()).await;
        coordinator.add_job(second.clone()).await;

        let got = coordinator.get_compaction_job("w1").await.unwrap().unwrap();
        assert_eq!(got.external_compaction_id, first.external_compaction_id);
        let got = coordinator.get_compaction_job("w1").await.unwrap().unwrap();
        assert_eq!(got.external_compaction_id, second.external_compaction_id);
        assert!(
            coordinator
                .get_compaction_job("w1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_injected_status_failures() {
        let coordinator = MemoryCoordinator::new();
        let ecid = ExternalCompactionId::generate();
        let update = CompactionStatusUpdate::new(CompactionState::Started, "started");
        coordinator.fail_next_status_updates(1).await;

        let err = coordinator
            .update_compaction_status(&ecid, &update)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        coordinator
            .update_compaction_status(&ecid, &update)
            .await
            .unwrap();

        assert_eq!(coordinator.status_calls().await, 2);
        assert_eq!(
            coordinator.states_for(&ecid).await,
            vec![CompactionState::Started]
        );
    }

    #[tokio::test]
    async fn test_should_cancel() {
        let coordinator = MemoryCoordinator::new();
        let job = job();
        assert!(!coordinator.should_cancel(&job).await.unwrap());
        coordinator.cancel(&job.external_compaction_id).await;
        assert!(coordinator.should_cancel(&job).await.unwrap());
    }
}
