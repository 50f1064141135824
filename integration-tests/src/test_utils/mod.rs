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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tablet_compactor_core::allocator::TabletFileAllocator;
use tablet_compactor_core::coordinator::MemoryCoordinator;
use tablet_compactor_core::merger::{MergerType, create_merger_factory};
use tablet_compactor_core::volume::LocalVolume;
use tablet_compactor_core::{
    CompactionExecutor, CompactionJob, InputFile, StatusRetryConfig, TabletId, WorkerConfigBuilder,
};
use tempfile::TempDir;

pub const TABLES_DIR: &str = "/tables";

/// A worker serving a temporary directory, with an in-memory coordinator.
pub struct LocalWorker {
    pub dir: TempDir,
    pub coordinator: Arc<MemoryCoordinator>,
    pub executor: Arc<CompactionExecutor>,
}

impl LocalWorker {
    pub fn new(merger: MergerType) -> Self {
        Self::with_status_retry(merger, fast_status_retry())
    }

    pub fn with_status_retry(merger: MergerType, status_retry: StatusRetryConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(MemoryCoordinator::new());
        let config = WorkerConfigBuilder::default()
            .worker_id("it-worker")
            .cancel_check_interval_ms(50)
            .idle_poll_interval_ms(10)
            .max_idle_poll_interval_ms(50)
            .status_retry(status_retry)
            .build()
            .unwrap();
        let executor = CompactionExecutor::new(
            config,
            coordinator.clone(),
            coordinator.clone(),
            Arc::new(LocalVolume::new(dir.path())),
            Arc::new(TabletFileAllocator::new(TABLES_DIR)),
        )
        .unwrap()
        .with_merger_factory(create_merger_factory(merger));

        Self {
            dir,
            coordinator,
            executor: Arc::new(executor),
        }
    }

    /// Local path of a volume path.
    pub fn local_path(&self, volume_path: &Path) -> PathBuf {
        self.dir
            .path()
            .join(volume_path.strip_prefix("/").unwrap_or(volume_path))
    }

    /// Writes `files` input files of `entries` lines each into the tablet's
    /// default directory and returns a job compacting them.
    pub fn write_job(&self, table_id: &str, files: usize, entries: usize) -> CompactionJob {
        let tablet_dir = Path::new(TABLES_DIR).join(table_id).join("default_tablet");
        let inputs = (0..files)
            .map(|f| {
                let path = tablet_dir.join(format!("F{f:04}.rf"));
                let data: String = (0..entries).map(|e| format!("row{f}_{e}\n")).collect();
                let local = self.local_path(&path);
                std::fs::create_dir_all(local.parent().unwrap()).unwrap();
                std::fs::write(&local, &data).unwrap();
                InputFile::new(path, data.len() as u64, entries as u64)
            })
            .collect();
        CompactionJob::new(TabletId::whole_table(table_id), inputs)
    }

    /// Every file under the tables directory whose name contains `marker`.
    pub fn files_containing(&self, marker: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![self.local_path(Path::new(TABLES_DIR))];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(marker))
                {
                    found.push(path);
                }
            }
        }
        found
    }
}

pub fn fast_status_retry() -> StatusRetryConfig {
    StatusRetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}
