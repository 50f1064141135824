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

use std::collections::VecDeque;

use async_trait::async_trait;

use super::{FileMerger, MergeRequest, MergeStep};
use crate::error::{CompactionError, Result};
use crate::job::CompactionStats;

/// Prefix of an entry that marks a deletion.
pub const DELETE_MARKER: &[u8] = b"DEL ";

pub const DEFAULT_READ_CHUNK_BYTES: usize = 64 * 1024;

/// Merger over newline-delimited entry files. Copies every entry of every
/// input file, in input order, into the output. Delete markers are dropped
/// unless the job asks for them to be propagated.
///
/// One increment either reads the next chunk of the current input file or
/// copies up to `batch_entries` entries, so no increment touches more than
/// one chunk of input.
pub struct ConcatMerger {
    request: MergeRequest,
    batch_entries: usize,
    read_chunk_bytes: usize,
    next_file: usize,
    offset: u64,
    /// Bytes after the last newline of the chunks read so far.
    partial: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    stats: CompactionStats,
}

impl ConcatMerger {
    pub fn new(request: MergeRequest, batch_entries: usize) -> Self {
        Self {
            request,
            batch_entries: batch_entries.max(1),
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            next_file: 0,
            offset: 0,
            partial: Vec::new(),
            pending: VecDeque::new(),
            stats: CompactionStats::default(),
        }
    }

    pub fn with_read_chunk_bytes(mut self, read_chunk_bytes: usize) -> Self {
        self.read_chunk_bytes = read_chunk_bytes.max(1);
        self
    }

    async fn read_next_chunk(&mut self) -> Result<()> {
        let input = &self.request.job.files[self.next_file];
        let chunk = self
            .request
            .volume
            .read_range(&input.path, self.offset, self.read_chunk_bytes)
            .await
            .map_err(|e| {
                CompactionError::Merge(format!("failed to read {}: {}", input.path.display(), e))
            })?;

        if chunk.is_empty() {
            // End of this input. A last entry without a trailing newline still counts.
            let last = std::mem::take(&mut self.partial);
            if !last.is_empty() {
                self.pending.push_back(last);
            }
            self.next_file += 1;
            self.offset = 0;
            return Ok(());
        }

        self.offset += chunk.len() as u64;
        self.partial.extend_from_slice(&chunk);
        if let Some(end) = self.partial.iter().rposition(|b| *b == b'\n') {
            let rest = self.partial.split_off(end + 1);
            let complete = std::mem::replace(&mut self.partial, rest);
            self.pending.extend(
                complete
                    .split(|b| *b == b'\n')
                    .filter(|entry| !entry.is_empty())
                    .map(<[u8]>::to_vec),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl FileMerger for ConcatMerger {
    async fn merge_increment(&mut self) -> Result<MergeStep> {
        if self.request.cancel_check.is_cancelled() {
            return Ok(MergeStep::Cancelled);
        }

        if self.pending.is_empty() {
            if self.next_file >= self.request.job.files.len() {
                return Ok(MergeStep::Finished(self.stats));
            }
            self.read_next_chunk().await?;
            return Ok(MergeStep::Progress(self.stats));
        }

        let propagate_deletes = self.request.job.propagate_deletes;
        let mut batch = Vec::new();
        for _ in 0..self.batch_entries {
            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            self.stats.entries_read += 1;
            if !propagate_deletes && entry.starts_with(DELETE_MARKER) {
                continue;
            }
            batch.extend_from_slice(&entry);
            batch.push(b'\n');
            self.stats.entries_written += 1;
        }

        if !batch.is_empty() {
            self.request
                .volume
                .append(&self.request.output.tmp_path, &batch)
                .await?;
            self.stats.bytes_written += batch.len() as u64;
        }
        Ok(MergeStep::Progress(self.stats))
    }
}
