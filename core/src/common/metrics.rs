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

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use mixtrics::metrics::{BoxedCounterVec, BoxedHistogramVec, BoxedRegistry, Buckets};
use mixtrics::registry::noop::NoopMetricsRegistry;

use crate::job::CompactionState;

pub struct Metrics {
    // job lifecycle metrics
    pub compaction_job_counter: BoxedCounterVec,
    pub compaction_job_duration: BoxedHistogramVec,
    pub compaction_entries_written: BoxedCounterVec,

    // coordinator interaction metrics
    pub status_report_attempts: BoxedCounterVec,
    pub status_report_exhausted: BoxedCounterVec,
    pub cancel_check_errors: BoxedCounterVec,
}

pub type MetricsRef = Arc<Metrics>;

impl Metrics {
    pub fn new(registry: BoxedRegistry) -> Self {
        let compaction_job_counter = registry.register_counter_vec(
            "tablet_compactor_job_counter".into(),
            "tablet-compactor finished jobs by terminal state".into(),
            &["worker_id", "state"],
        );

        let compaction_job_duration = registry.register_histogram_vec_with_buckets(
            "tablet_compactor_job_duration".into(),
            "tablet-compactor job duration in seconds".into(),
            &["worker_id", "state"],
            Buckets::exponential(
                0.1, 4.0, 10, // Start at 100ms, multiply each bucket by 4, up to 10 buckets
            ),
        );

        let compaction_entries_written = registry.register_counter_vec(
            "tablet_compactor_entries_written".into(),
            "tablet-compactor entries written by successful jobs".into(),
            &["worker_id"],
        );

        let status_report_attempts = registry.register_counter_vec(
            "tablet_compactor_status_report_attempts".into(),
            "tablet-compactor status update attempts sent to the coordinator".into(),
            &["state"],
        );

        let status_report_exhausted = registry.register_counter_vec(
            "tablet_compactor_status_report_exhausted".into(),
            "tablet-compactor status updates abandoned after the retry budget".into(),
            &["state"],
        );

        let cancel_check_errors = registry.register_counter_vec(
            "tablet_compactor_cancel_check_errors".into(),
            "tablet-compactor failed cancellation authority lookups".into(),
            &["worker_id"],
        );

        Self {
            compaction_job_counter,
            compaction_job_duration,
            compaction_entries_written,
            status_report_attempts,
            status_report_exhausted,
            cancel_check_errors,
        }
    }

    pub fn noop() -> Self {
        Self::new(Box::new(NoopMetricsRegistry))
    }

    pub fn record_job(&self, worker_id: &str, state: CompactionState, elapsed: Duration) {
        let labels = [
            Cow::Owned(worker_id.to_owned()),
            Cow::Borrowed(state.as_str()),
        ];
        self.compaction_job_counter.counter(&labels).increase(1);
        self.compaction_job_duration
            .histogram(&labels)
            .record(elapsed.as_secs_f64());
    }

    pub fn record_entries_written(&self, worker_id: &str, entries: u64) {
        self.compaction_entries_written
            .counter(&[Cow::Owned(worker_id.to_owned())])
            .increase(entries);
    }

    pub fn record_status_attempt(&self, state: CompactionState) {
        self.status_report_attempts
            .counter(&[Cow::Borrowed(state.as_str())])
            .increase(1);
    }

    pub fn record_status_exhausted(&self, state: CompactionState) {
        self.status_report_exhausted
            .counter(&[Cow::Borrowed(state.as_str())])
            .increase(1);
    }

    pub fn record_cancel_check_error(&self, worker_id: &str) {
        self.cancel_check_errors
            .counter(&[Cow::Owned(worker_id.to_owned())])
            .increase(1);
    }
}
