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

use async_trait::async_trait;

use super::{FileMerger, MergeRequest, MergeStep};
use crate::error::{CompactionError, Result};
use crate::job::CompactionStats;

/// Scripted behaviours for exercising the worker without real input files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Writes one entry per increment and finishes after `increments` of them.
    Complete { increments: usize },
    /// Keeps working until the job is cancelled, pausing between increments.
    NeverFinish { pause: Duration },
    /// Fails with an I/O error on increment number `at` (1-based).
    FailAt { at: usize },
    /// Reports that the tablet has too many files queued.
    TooManyFiles,
    /// Cannot be constructed.
    FailToCreate,
}

pub struct MockMerger {
    request: MergeRequest,
    behavior: MockBehavior,
    increments: usize,
    stats: CompactionStats,
}

impl MockMerger {
    pub fn try_new(request: MergeRequest, behavior: MockBehavior) -> Result<Self> {
        if behavior == MockBehavior::FailToCreate {
            return Err(CompactionError::Merge(format!(
                "cannot open inputs of {}",
                request.job.external_compaction_id
            )));
        }
        Ok(Self {
            request,
            behavior,
            increments: 0,
            stats: CompactionStats::default(),
        })
    }

    async fn write_entry(&mut self) -> Result<()> {
        let entry = format!("entry-{}\n", self.increments);
        self.request
            .volume
            .append(&self.request.output.tmp_path, entry.as_bytes())
            .await?;
        self.stats.entries_read += 1;
        self.stats.entries_written += 1;
        self.stats.bytes_written += entry.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl FileMerger for MockMerger {
    async fn merge_increment(&mut self) -> Result<MergeStep> {
        if self.request.cancel_check.is_cancelled() {
            return Ok(MergeStep::Cancelled);
        }
        self.increments += 1;

        match self.behavior.clone() {
            MockBehavior::Complete { increments } => {
                if self.increments > increments {
                    return Ok(MergeStep::Finished(self.stats));
                }
                self.write_entry().await?;
                Ok(MergeStep::Progress(self.stats))
            }
            MockBehavior::NeverFinish { pause } => {
                tokio::time::sleep(pause).await;
                self.write_entry().await?;
                Ok(MergeStep::Progress(self.stats))
            }
            MockBehavior::FailAt { at } => {
                if self.increments >= at {
                    return Err(CompactionError::Io(std::io::Error::other(format!(
                        "injected read failure at increment {}",
                        self.increments
                    ))));
                }
                self.write_entry().await?;
                Ok(MergeStep::Progress(self.stats))
            }
            MockBehavior::TooManyFiles => Err(CompactionError::TooManyFiles {
                tablet: self.request.job.tablet.to_string(),
            }),
            MockBehavior::FailToCreate => Err(CompactionError::Merge(
                "merger was never constructed".to_owned(),
            )),
        }
    }
}
