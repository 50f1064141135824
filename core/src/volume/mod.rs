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

//! Filesystem layer used to create, fill, delete and finalize compaction
//! output files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CompactionError, Result};

pub mod local;
pub mod memory;

pub use local::LocalVolume;
pub use memory::MemoryVolume;

/// Marker separating a final file name from the temporary suffix.
pub const TMP_MARKER: &str = "_tmp_";

#[async_trait]
pub trait Volume: Send + Sync + 'static {
    /// Creates an empty file. Fails if the file already exists.
    async fn create_file(&self, path: &Path) -> Result<()>;

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Reads at most `len` bytes starting at `offset`. An empty result means
    /// `offset` is at or past the end of the file.
    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Removes a file. Removing a missing file is not an error.
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Moves a temporary output file to its final name and returns that name.
    async fn rename_to_final(&self, tmp_path: &Path) -> Result<PathBuf>;
}

pub type VolumeRef = Arc<dyn Volume>;

/// `A0001.rf_tmp_ECID:...` becomes `A0001.rf` in the same directory.
pub fn final_path(tmp_path: &Path) -> Result<PathBuf> {
    let file_name = tmp_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            CompactionError::Execution(format!("invalid output path {}", tmp_path.display()))
        })?;
    let (final_name, _) = file_name.split_once(TMP_MARKER).ok_or_else(|| {
        CompactionError::Execution(format!(
            "{} is not a temporary output file",
            tmp_path.display()
        ))
    })?;
    Ok(tmp_path.with_file_name(final_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_path() {
        let tmp = Path::new("/tables/1/t-01/A0000a.rf_tmp_ECID:1234");
        assert_eq!(
            final_path(tmp).unwrap(),
            PathBuf::from("/tables/1/t-01/A0000a.rf")
        );
        assert!(final_path(Path::new("/tables/1/t-01/A0000a.rf")).is_err());
    }
}
