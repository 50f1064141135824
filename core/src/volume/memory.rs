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

use std::collections::BTreeMap;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Volume, final_path};
use crate::error::{CompactionError, Result};

#[derive(Debug, Default)]
struct VolumeState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    fail_creates: bool,
}

/// Volume keeping every file in memory, with optional failure injection for
/// file creation.
#[derive(Debug, Default)]
pub struct MemoryVolume {
    state: Mutex<VolumeState>,
}

impl MemoryVolume {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_creates(&self, fail: bool) {
        self.state.lock().await.fail_creates = fail;
    }

    pub async fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .await
            .files
            .insert(path.into(), data.into());
    }

    pub async fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().await.files.keys().cloned().collect()
    }
}

fn not_found(path: &Path) -> CompactionError {
    CompactionError::Io(IoError::new(
        ErrorKind::NotFound,
        format!("{} does not exist", path.display()),
    ))
}

#[async_trait]
impl Volume for MemoryVolume {
    async fn create_file(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_creates {
            return Err(CompactionError::Io(IoError::new(
                ErrorKind::PermissionDenied,
                format!("cannot create {}", path.display()),
            )));
        }
        if state.files.contains_key(path) {
            return Err(CompactionError::Io(IoError::new(
                ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        state.files.insert(path.to_path_buf(), Vec::new());
        Ok(())
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.extend_from_slice(data);
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let data = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(data.clone())
    }

    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let data = state.files.get(path).ok_or_else(|| not_found(path))?;
        let start = offset.min(data.len() as u64) as usize;
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().await.files.contains_key(path))
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        self.state.lock().await.files.remove(path);
        Ok(())
    }

    async fn rename_to_final(&self, tmp_path: &Path) -> Result<PathBuf> {
        let final_path = final_path(tmp_path)?;
        let mut state = self.state.lock().await;
        let data = state
            .files
            .remove(tmp_path)
            .ok_or_else(|| not_found(tmp_path))?;
        state.files.insert(final_path.clone(), data);
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_volume_create_failure() {
        let volume = MemoryVolume::new();
        volume.fail_creates(true).await;
        let path = Path::new("/tables/1/t-1/A1.rf_tmp_ECID:1");
        assert!(volume.create_file(path).await.is_err());
        assert!(volume.paths().await.is_empty());

        volume.fail_creates(false).await;
        volume.create_file(path).await.unwrap();
        volume.append(path, b"abc").await.unwrap();
        let final_path = volume.rename_to_final(path).await.unwrap();
        assert_eq!(volume.read(&final_path).await.unwrap(), b"abc");
        assert_eq!(volume.read_range(&final_path, 1, 5).await.unwrap(), b"bc");
        assert_eq!(volume.read_range(&final_path, 7, 5).await.unwrap(), b"");
        assert_eq!(volume.paths().await, vec![final_path]);
    }
}
