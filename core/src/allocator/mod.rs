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

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CompactionError, Result};
use crate::job::{CompactionJob, TabletId};
use crate::volume::TMP_MARKER;

/// Execution hint carrying the tablet's directory name, when the coordinator
/// knows it.
pub const TABLET_DIR_HINT: &str = "tablet.dir";

const DEFAULT_TABLET_DIR: &str = "default_tablet";
const FILE_EXTENSION: &str = "rf";

/// Paths of one compaction output: where it is written, and the name it takes
/// once finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub tmp_path: PathBuf,
    pub final_path: PathBuf,
}

#[async_trait]
pub trait OutputFileAllocator: Send + Sync + 'static {
    /// Returns a fresh output location for `job`, distinct from any path
    /// handed out before, for this or any other job.
    async fn allocate_output_path(&self, job: &CompactionJob) -> Result<OutputFile>;
}

pub type OutputFileAllocatorRef = Arc<dyn OutputFileAllocator>;

/// Names output files after the tablet directory they belong to:
/// `<base>/<table>/<dir>/<A|C><unique>.rf_tmp_<ECID>`.
///
/// `A` marks a full compaction that dropped delete markers, `C` one that
/// kept them.
#[derive(Debug, Clone)]
pub struct TabletFileAllocator {
    base_dir: PathBuf,
}

impl TabletFileAllocator {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn tablet_dir(job: &CompactionJob) -> String {
        if let Some(dir) = job.execution_hints.get(TABLET_DIR_HINT) {
            return dir.clone();
        }
        Self::derived_tablet_dir(&job.tablet)
    }

    fn derived_tablet_dir(tablet: &TabletId) -> String {
        match &tablet.end_row {
            None => DEFAULT_TABLET_DIR.to_owned(),
            Some(end_row) => {
                let mut hasher = DefaultHasher::new();
                end_row.hash(&mut hasher);
                format!("t-{:016x}", hasher.finish())
            }
        }
    }
}

#[async_trait]
impl OutputFileAllocator for TabletFileAllocator {
    async fn allocate_output_path(&self, job: &CompactionJob) -> Result<OutputFile> {
        if job.tablet.table_id.is_empty() {
            return Err(CompactionError::Allocation(format!(
                "job {} has no table id",
                job.external_compaction_id
            )));
        }

        let prefix = if job.propagate_deletes { 'C' } else { 'A' };
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!("{prefix}{unique}.{FILE_EXTENSION}");
        let final_path = self
            .base_dir
            .join(&job.tablet.table_id)
            .join(Self::tablet_dir(job))
            .join(&file_name);
        let tmp_path = final_path.with_file_name(format!(
            "{file_name}{TMP_MARKER}{}",
            job.external_compaction_id
        ));

        Ok(OutputFile {
            tmp_path,
            final_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::job::InputFile;
    use crate::volume::final_path;

    fn job(tablet: TabletId, files: usize) -> CompactionJob {
        let files = (0..files)
            .map(|i| InputFile::new(format!("/tables/1/t/F{i}.rf"), 10, 1))
            .collect();
        CompactionJob::new(tablet, files)
    }

    #[tokio::test]
    async fn test_output_naming() {
        let allocator = TabletFileAllocator::new("/tables");
        let full = job(TabletId::whole_table("7"), 2);
        let output = allocator.allocate_output_path(&full).await.unwrap();

        let tmp = output.tmp_path.to_str().unwrap();
        assert!(tmp.starts_with("/tables/7/default_tablet/A"));
        assert!(tmp.ends_with(&format!(".rf_tmp_{}", full.external_compaction_id)));
        assert_eq!(final_path(&output.tmp_path).unwrap(), output.final_path);

        let partial = job(TabletId::new("7", Some("m"), None), 2).with_propagate_deletes(true);
        let output = allocator.allocate_output_path(&partial).await.unwrap();
        let name = output.final_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with('C'));
        let dir = output.final_path.parent().unwrap();
        assert_eq!(dir.parent().unwrap(), Path::new("/tables/7"));
        assert!(dir.file_name().unwrap().to_str().unwrap().starts_with("t-"));
    }

    #[tokio::test]
    async fn test_paths_never_collide() {
        let allocator = TabletFileAllocator::new("/tables");
        let job = job(TabletId::whole_table("1"), 1);
        let first = allocator.allocate_output_path(&job).await.unwrap();
        let second = allocator.allocate_output_path(&job).await.unwrap();
        assert_ne!(first.tmp_path, second.tmp_path);
        assert_ne!(first.final_path, second.final_path);
    }

    #[tokio::test]
    async fn test_tablet_dir_hint() {
        let allocator = TabletFileAllocator::new("/tables");
        let job = job(TabletId::new("1", Some("q"), Some("f")), 1)
            .with_execution_hint(TABLET_DIR_HINT, "t-0000ab");
        let output = allocator.allocate_output_path(&job).await.unwrap();
        assert!(output.final_path.starts_with("/tables/1/t-0000ab"));
    }
}
