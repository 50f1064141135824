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

//! The merge engine seam. A [`FileMerger`] does bounded units of work and
//! reports after each one whether it progressed, finished, or noticed that
//! the job was cancelled. Which merger a worker uses is decided by the
//! [`MergerFactory`] it is built with.

use std::sync::Arc;

use async_trait::async_trait;

use crate::allocator::OutputFile;
use crate::error::Result;
use crate::holder::CancelCheck;
use crate::job::{CompactionJob, CompactionStats};
use crate::volume::VolumeRef;

pub mod concat;
pub mod mock;

pub use concat::ConcatMerger;
pub use mock::{MockBehavior, MockMerger};

pub const DEFAULT_BATCH_ENTRIES: usize = 1024;

/// Outcome of one merge increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    /// More work remains. Carries the counters so far.
    Progress(CompactionStats),
    /// All input has been consumed and the output is complete.
    Finished(CompactionStats),
    /// The merger observed the cancellation flag and stopped.
    Cancelled,
}

#[async_trait]
pub trait FileMerger: Send {
    /// Performs one bounded unit of merge work. Implementations must keep
    /// increments short, cancellation latency is bounded by their length.
    async fn merge_increment(&mut self) -> Result<MergeStep>;
}

/// Everything a merger is bound to at construction.
#[derive(Clone)]
pub struct MergeRequest {
    pub job: Arc<CompactionJob>,
    pub output: OutputFile,
    pub volume: VolumeRef,
    pub cancel_check: CancelCheck,
}

pub trait MergerFactory: Send + Sync + 'static {
    fn create_merger(&self, request: MergeRequest) -> Result<Box<dyn FileMerger>>;
}

pub type MergerFactoryRef = Arc<dyn MergerFactory>;

#[derive(Debug, Clone)]
pub enum MergerType {
    Concat { batch_entries: usize },
    Mock(MockBehavior),
}

impl Default for MergerType {
    fn default() -> Self {
        MergerType::Concat {
            batch_entries: DEFAULT_BATCH_ENTRIES,
        }
    }
}

impl MergerFactory for MergerType {
    fn create_merger(&self, request: MergeRequest) -> Result<Box<dyn FileMerger>> {
        match self {
            MergerType::Concat { batch_entries } => {
                Ok(Box::new(ConcatMerger::new(request, *batch_entries)))
            }
            MergerType::Mock(behavior) => {
                Ok(Box::new(MockMerger::try_new(request, behavior.clone())?))
            }
        }
    }
}

pub fn create_merger_factory(merger_type: MergerType) -> MergerFactoryRef {
    Arc::new(merger_type)
}
