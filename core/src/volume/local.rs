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

use std::io::{Error as IoError, ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{Volume, final_path};
use crate::error::{CompactionError, Result};

/// Volume backed by a directory of the local filesystem. Logical paths are
/// resolved relative to `root`, whether or not they start with `/`, and may
/// not climb out of it.
#[derive(Debug, Clone)]
pub struct LocalVolume {
    root: PathBuf,
}

impl LocalVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(CompactionError::Io(IoError::new(
                ErrorKind::InvalidInput,
                format!("{} escapes the volume root", path.display()),
            )));
        }
        Ok(self.root.join(path.strip_prefix("/").unwrap_or(path)))
    }
}

#[async_trait]
impl Volume for LocalVolume {
    async fn create_file(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(())
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.resolve(path)?)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path)?).await?)
    }

    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(self.resolve(path)?).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(self.resolve(path)?).await?)
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename_to_final(&self, tmp_path: &Path) -> Result<PathBuf> {
        let final_path = final_path(tmp_path)?;
        fs::rename(self.resolve(tmp_path)?, self.resolve(&final_path)?).await?;
        Ok(final_path)
    }
}
