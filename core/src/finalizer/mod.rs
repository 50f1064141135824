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

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::allocator::OutputFile;
use crate::error::Result;
use crate::job::CompactionJob;
use crate::volume::VolumeRef;

/// Hands a successful output over to the tablet's live file set.
#[async_trait]
pub trait OutputFinalizer: Send + Sync + 'static {
    /// Returns where the output lives after the handoff.
    async fn finalize(
        &self,
        job: &CompactionJob,
        output: &OutputFile,
        volume: &VolumeRef,
    ) -> Result<PathBuf>;
}

pub type OutputFinalizerRef = Arc<dyn OutputFinalizer>;

/// Leaves the output at its temporary path; the coordinator renames it when
/// it commits the compaction to the tablet's metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoordinatorCommitFinalizer;

#[async_trait]
impl OutputFinalizer for CoordinatorCommitFinalizer {
    async fn finalize(
        &self,
        _job: &CompactionJob,
        output: &OutputFile,
        _volume: &VolumeRef,
    ) -> Result<PathBuf> {
        Ok(output.tmp_path.clone())
    }
}

/// Renames the output to its final name on the volume.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameFinalizer;

#[async_trait]
impl OutputFinalizer for RenameFinalizer {
    async fn finalize(
        &self,
        job: &CompactionJob,
        output: &OutputFile,
        volume: &VolumeRef,
    ) -> Result<PathBuf> {
        let final_path = volume.rename_to_final(&output.tmp_path).await?;
        tracing::info!(
            ecid = %job.external_compaction_id,
            "Renamed {} to {}",
            output.tmp_path.display(),
            final_path.display()
        );
        Ok(final_path)
    }
}
