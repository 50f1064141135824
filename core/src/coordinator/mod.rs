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

//! The worker's view of the remote coordinator: where jobs come from, where
//! status goes, and who decides that a running job is no longer wanted.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{CompactionJob, CompactionStatusUpdate, ExternalCompactionId};

pub mod memory;
pub use memory::MemoryCoordinator;

#[async_trait]
pub trait CoordinatorClient: Send + Sync + 'static {
    /// Asks for the next job for `worker_id`. `None` means there is no work.
    async fn get_compaction_job(&self, worker_id: &str) -> Result<Option<CompactionJob>>;

    /// Delivers one status transition. Implementations return
    /// `CompactionError::Transport` for failures worth retrying; the
    /// coordinator tolerates duplicate identical updates.
    async fn update_compaction_status(
        &self,
        ecid: &ExternalCompactionId,
        update: &CompactionStatusUpdate,
    ) -> Result<()>;
}

pub type CoordinatorClientRef = Arc<dyn CoordinatorClient>;

/// Authority consulted by the cancel checker, e.g. a lease, an explicit
/// cancel call or the tablet's metadata.
#[async_trait]
pub trait CancellationSource: Send + Sync + 'static {
    async fn should_cancel(&self, job: &CompactionJob) -> Result<bool>;
}

pub type CancellationSourceRef = Arc<dyn CancellationSource>;
