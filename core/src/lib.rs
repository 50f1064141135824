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

pub mod allocator;
pub mod cancel_checker;
pub mod common;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod finalizer;
pub mod holder;
pub mod job;
pub mod merger;
pub mod reporter;
pub mod runnable;
pub mod volume;

pub use config::{StatusRetryConfig, WorkerConfig, WorkerConfigBuilder};
pub use error::{CompactionError, Result};
pub use executor::{CompactionExecutor, JobHandle};
pub use job::{
    CompactionJob, CompactionState, CompactionStats, CompactionStatusUpdate, ExternalCompactionId,
    InputFile, TabletId,
};
pub use runnable::CompactionOutcome;
