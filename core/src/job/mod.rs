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

//! Job descriptors received from the coordinator and the status values
//! reported back for them.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{CompactionError, Result};

/// Opaque token correlating one compaction across the worker and the
/// coordinator. Rendered as `ECID:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalCompactionId(String);

impl ExternalCompactionId {
    pub const PREFIX: &'static str = "ECID:";

    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ExternalCompactionId {
    type Err = CompactionError;

    fn from_str(s: &str) -> Result<Self> {
        let uuid = s.strip_prefix(Self::PREFIX).ok_or_else(|| {
            CompactionError::Config(format!("external compaction id must start with ECID: {s}"))
        })?;
        uuid::Uuid::parse_str(uuid).map_err(|e| {
            CompactionError::Config(format!("invalid external compaction id {s}: {e}"))
        })?;
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for ExternalCompactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous key range of one table. `end_row == None` is the last tablet
/// of the table, `prev_end_row == None` the first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabletId {
    pub table_id: String,
    pub end_row: Option<String>,
    pub prev_end_row: Option<String>,
}

impl TabletId {
    pub fn new(
        table_id: impl Into<String>,
        end_row: Option<&str>,
        prev_end_row: Option<&str>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            end_row: end_row.map(str::to_owned),
            prev_end_row: prev_end_row.map(str::to_owned),
        }
    }

    /// The single tablet covering a whole table.
    pub fn whole_table(table_id: impl Into<String>) -> Self {
        Self::new(table_id, None, None)
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end_row {
            Some(end_row) => write!(f, "{};{}", self.table_id, end_row),
            None => write!(f, "{}<", self.table_id),
        }
    }
}

/// A data file selected as compaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    pub size: u64,
    pub entries: u64,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>, size: u64, entries: u64) -> Self {
        Self {
            path: path.into(),
            size,
            entries,
        }
    }
}

/// Immutable description of one compaction, handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct CompactionJob {
    pub external_compaction_id: ExternalCompactionId,
    pub tablet: TabletId,
    pub files: Vec<InputFile>,
    /// Delete markers must survive into the output when not every file of the
    /// tablet takes part in the compaction.
    pub propagate_deletes: bool,
    pub execution_hints: HashMap<String, String>,
}

impl CompactionJob {
    pub fn new(tablet: TabletId, files: Vec<InputFile>) -> Self {
        Self {
            external_compaction_id: ExternalCompactionId::generate(),
            tablet,
            files,
            propagate_deletes: false,
            execution_hints: HashMap::new(),
        }
    }

    pub fn with_external_compaction_id(mut self, ecid: ExternalCompactionId) -> Self {
        self.external_compaction_id = ecid;
        self
    }

    pub fn with_propagate_deletes(mut self, propagate_deletes: bool) -> Self {
        self.propagate_deletes = propagate_deletes;
        self
    }

    pub fn with_execution_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.execution_hints.insert(key.into(), value.into());
        self
    }

    pub fn input_entries(&self) -> u64 {
        self.files.iter().map(|f| f.entries).sum()
    }

    pub fn input_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionState {
    Started,
    InProgress,
    Cancelled,
    Failed,
    Succeeded,
}

impl CompactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompactionState::Cancelled | CompactionState::Failed | CompactionState::Succeeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionState::Started => "STARTED",
            CompactionState::InProgress => "IN_PROGRESS",
            CompactionState::Cancelled => "CANCELLED",
            CompactionState::Failed => "FAILED",
            CompactionState::Succeeded => "SUCCEEDED",
        }
    }
}

impl fmt::Display for CompactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry and byte counters of a merge, either in flight or final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionStats {
    pub entries_read: u64,
    pub entries_written: u64,
    pub bytes_written: u64,
}

/// A lifecycle transition sent to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStatusUpdate {
    pub state: CompactionState,
    pub message: Option<String>,
    pub entries_to_be_compacted: u64,
    pub stats: CompactionStats,
}

impl CompactionStatusUpdate {
    pub fn new(state: CompactionState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: Some(message.into()),
            entries_to_be_compacted: 0,
            stats: CompactionStats::default(),
        }
    }

    pub fn with_entries_to_be_compacted(mut self, entries: u64) -> Self {
        self.entries_to_be_compacted = entries;
        self
    }

    pub fn with_stats(mut self, stats: CompactionStats) -> Self {
        self.stats = stats;
        self
    }
}
