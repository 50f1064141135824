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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder, Retryable};

use crate::common::metrics::MetricsRef;
use crate::config::StatusRetryConfig;
use crate::coordinator::CoordinatorClientRef;
use crate::error::{CompactionError, Result};
use crate::job::{CompactionStatusUpdate, ExternalCompactionId};

/// Sends status transitions to the coordinator with a bounded retry budget.
///
/// Transport failures are retried; once the budget is spent the caller gets
/// [`CompactionError::RetriesExceeded`] instead of the last transport error.
/// Any other error from the coordinator is returned as is, without retry.
pub struct StatusReporter {
    coordinator: CoordinatorClientRef,
    config: StatusRetryConfig,
    metrics: Option<MetricsRef>,
}

pub type StatusReporterRef = Arc<StatusReporter>;

impl StatusReporter {
    pub fn new(coordinator: CoordinatorClientRef, config: StatusRetryConfig) -> Self {
        Self {
            coordinator,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRef) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Single delivery attempt for updates that are superseded by the next one
    /// anyway, such as progress.
    pub async fn try_report(
        &self,
        ecid: &ExternalCompactionId,
        update: CompactionStatusUpdate,
    ) -> Result<()> {
        if let Some(metrics) = &self.metrics {
            metrics.record_status_attempt(update.state);
        }
        self.coordinator
            .update_compaction_status(ecid, &update)
            .await
    }

    pub async fn report(
        &self,
        ecid: &ExternalCompactionId,
        update: CompactionStatusUpdate,
    ) -> Result<()> {
        let attempts = AtomicUsize::new(0);
        let update = &update;
        let state = update.state;
        let operation = || {
            attempts.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_status_attempt(state);
            }
            let coordinator = self.coordinator.clone();
            async move { coordinator.update_compaction_status(ecid, update).await }
        };

        let notify = |err: &CompactionError, delay: Duration| {
            tracing::debug!(
                ecid = %ecid,
                state = %state,
                "Status update failed, retrying in {:?}: {}",
                delay,
                err
            );
        };

        let retries = self.config.max_attempts.saturating_sub(1);
        let result = if self.config.is_constant() {
            let strategy = ConstantBuilder::default()
                .with_delay(self.config.initial_delay())
                .with_max_times(retries);
            operation
                .retry(strategy)
                .when(|e: &CompactionError| e.is_retryable())
                .notify(notify)
                .await
        } else {
            let strategy = ExponentialBuilder::default()
                .with_min_delay(self.config.initial_delay())
                .with_max_delay(self.config.max_delay())
                .with_max_times(retries);
            operation
                .retry(strategy)
                .when(|e: &CompactionError| e.is_retryable())
                .notify(notify)
                .await
        };

        result.map_err(|e| {
            if !e.is_retryable() {
                return e;
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_status_exhausted(state);
            }
            CompactionError::RetriesExceeded {
                attempts: attempts.load(Ordering::Relaxed),
                last_error: e.to_string(),
            }
        })
    }
}
