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

use derive_builder::Builder;
use serde::Deserialize;

use crate::error::{CompactionError, Result};

pub const DEFAULT_CANCEL_CHECK_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_PROGRESS_REPORT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_IDLE_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_IDLE_POLL_INTERVAL_MS: u64 = 10_000;

pub const DEFAULT_STATUS_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_STATUS_INITIAL_DELAY_MS: u64 = 100;
pub const DEFAULT_STATUS_MAX_DELAY_MS: u64 = 5_000;

fn default_worker_id() -> String {
    format!("compactor-{}", uuid::Uuid::new_v4())
}

/// Retry budget applied to every status update sent to the coordinator.
///
/// When `initial_delay_ms == max_delay_ms` the delay between attempts is
/// constant, otherwise it doubles from `initial_delay_ms` up to `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusRetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StatusRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_STATUS_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_STATUS_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_STATUS_MAX_DELAY_MS,
        }
    }
}

impl StatusRetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn is_constant(&self) -> bool {
        self.initial_delay_ms == self.max_delay_ms
    }
}

#[derive(Builder, Debug, Clone, Deserialize)]
#[builder(build_fn(error = "CompactionError"))]
#[serde(default)]
pub struct WorkerConfig {
    /// Name this worker uses when asking the coordinator for work.
    #[builder(setter(into), default = "default_worker_id()")]
    pub worker_id: String,

    #[builder(default = "DEFAULT_CANCEL_CHECK_INTERVAL_MS")]
    pub cancel_check_interval_ms: u64,

    #[builder(default)]
    pub status_retry: StatusRetryConfig,

    /// Minimum spacing between two `IN_PROGRESS` updates of the same job.
    #[builder(default = "DEFAULT_PROGRESS_REPORT_INTERVAL_MS")]
    pub progress_report_interval_ms: u64,

    #[builder(default = "DEFAULT_IDLE_POLL_INTERVAL_MS")]
    pub idle_poll_interval_ms: u64,

    #[builder(default = "DEFAULT_MAX_IDLE_POLL_INTERVAL_MS")]
    pub max_idle_poll_interval_ms: u64,

    /// Files-per-tablet ceiling, 0 disables the check.
    #[builder(default)]
    pub max_input_files: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            cancel_check_interval_ms: DEFAULT_CANCEL_CHECK_INTERVAL_MS,
            status_retry: StatusRetryConfig::default(),
            progress_report_interval_ms: DEFAULT_PROGRESS_REPORT_INTERVAL_MS,
            idle_poll_interval_ms: DEFAULT_IDLE_POLL_INTERVAL_MS,
            max_idle_poll_interval_ms: DEFAULT_MAX_IDLE_POLL_INTERVAL_MS,
            max_input_files: 0,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(CompactionError::Config(
                "worker_id must not be empty".to_owned(),
            ));
        }
        if self.cancel_check_interval_ms == 0 {
            return Err(CompactionError::Config(
                "cancel_check_interval_ms must be greater than 0".to_owned(),
            ));
        }
        if self.idle_poll_interval_ms == 0
            || self.idle_poll_interval_ms > self.max_idle_poll_interval_ms
        {
            return Err(CompactionError::Config(format!(
                "invalid idle poll interval range [{}, {}]",
                self.idle_poll_interval_ms, self.max_idle_poll_interval_ms
            )));
        }
        if self.status_retry.max_attempts == 0 {
            return Err(CompactionError::Config(
                "status_retry.max_attempts must be greater than 0".to_owned(),
            ));
        }
        if self.status_retry.initial_delay_ms > self.status_retry.max_delay_ms {
            return Err(CompactionError::Config(format!(
                "status_retry.initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.status_retry.initial_delay_ms, self.status_retry.max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    pub fn progress_report_interval(&self) -> Duration {
        Duration::from_millis(self.progress_report_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn max_idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_idle_poll_interval_ms)
    }
}
