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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{CompactionError, Result};
use crate::job::{CompactionJob, ExternalCompactionId};

/// Single slot holding the job this worker is currently running, and whether
/// that job has been asked to stop.
///
/// The slot is shared between the running job, the cancel checker and the
/// shutdown path. Reading the cancellation flag never takes the lock, so the
/// merge loop can poll it as often as it likes.
#[derive(Debug, Default)]
pub struct JobHolder {
    current: Mutex<Option<Arc<CompactionJob>>>,
    cancelled: AtomicBool,
}

pub type JobHolderRef = Arc<JobHolder>;

impl JobHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for `job`. Claiming an occupied slot is a caller bug and
    /// is rejected without touching the running job.
    pub fn set_current(&self, job: Arc<CompactionJob>) -> Result<()> {
        let mut current = self.current.lock();
        if let Some(running) = current.as_ref() {
            return Err(CompactionError::JobSlotOccupied {
                running: running.external_compaction_id.to_string(),
            });
        }
        self.cancelled.store(false, Ordering::Release);
        *current = Some(job);
        Ok(())
    }

    /// Releases the slot and resets the cancellation flag.
    pub fn clear(&self) {
        let mut current = self.current.lock();
        *current = None;
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn current(&self) -> Option<Arc<CompactionJob>> {
        self.current.lock().clone()
    }

    pub fn is_occupied(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Flags the running job as cancelled. Returns false when the slot is empty.
    pub fn cancel(&self) -> bool {
        let current = self.current.lock();
        if current.is_none() {
            return false;
        }
        self.cancelled.store(true, Ordering::Release);
        true
    }

    /// Flags the running job only when it is the one identified by `ecid`.
    pub fn cancel_job(&self, ecid: &ExternalCompactionId) -> bool {
        let current = self.current.lock();
        match current.as_ref() {
            Some(job) if &job.external_compaction_id == ecid => {
                self.cancelled.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_check(self: &Arc<Self>) -> CancelCheck {
        CancelCheck(self.clone())
    }
}

/// Read-only view of the cancellation flag handed to file mergers.
#[derive(Debug, Clone)]
pub struct CancelCheck(JobHolderRef);

impl CancelCheck {
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{InputFile, TabletId};

    fn job() -> Arc<CompactionJob> {
        Arc::new(CompactionJob::new(
            TabletId::whole_table("1"),
            vec![InputFile::new("/t/1/a.rf", 1, 1)],
        ))
    }

    #[test]
    fn test_single_slot() {
        let holder = JobHolder::new();
        let first = job();
        holder.set_current(first.clone()).unwrap();

        let err = holder.set_current(job()).unwrap_err();
        match err {
            CompactionError::JobSlotOccupied { running } => {
                assert_eq!(running, first.external_compaction_id.to_string())
            }
            e => panic!("unexpected error {e}"),
        }
        assert_eq!(
            holder.current().unwrap().external_compaction_id,
            first.external_compaction_id
        );

        holder.clear();
        assert!(!holder.is_occupied());
        holder.set_current(job()).unwrap();
    }

    #[test]
    fn test_cancel_is_idempotent_and_ignores_empty_slot() {
        let holder = Arc::new(JobHolder::new());
        assert!(!holder.cancel());
        assert!(!holder.is_cancelled());

        holder.set_current(job()).unwrap();
        let check = holder.cancel_check();
        assert!(!check.is_cancelled());
        assert!(holder.cancel());
        assert!(holder.cancel());
        assert!(check.is_cancelled());

        holder.clear();
        assert!(!holder.is_cancelled());
    }

    #[test]
    fn test_cancel_job_matches_running_job_only() {
        let holder = JobHolder::new();
        let running = job();
        holder.set_current(running.clone()).unwrap();

        assert!(!holder.cancel_job(&ExternalCompactionId::generate()));
        assert!(!holder.is_cancelled());

        assert!(holder.cancel_job(&running.external_compaction_id));
        assert!(holder.is_cancelled());
    }

    #[test]
    fn test_new_job_starts_uncancelled() {
        let holder = JobHolder::new();
        holder.set_current(job()).unwrap();
        holder.cancel();
        holder.clear();
        holder.set_current(job()).unwrap();
        assert!(!holder.is_cancelled());
    }
}
