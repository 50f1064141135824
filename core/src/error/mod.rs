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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    /// The running job observed a cancellation request between merge increments.
    #[error("Compaction cancelled")]
    Cancelled,

    /// A status update could not be delivered within the retry budget. The
    /// coordinator's view of the job is unknown, the local job state stands.
    #[error("Retries exceeded after {attempts} attempts: {last_error}")]
    RetriesExceeded { attempts: usize, last_error: String },

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Output allocation failed: {0}")]
    Allocation(String),

    #[error("Too many files queued for tablet {tablet}")]
    TooManyFiles { tablet: String },

    #[error("Coordinator transport error: {0}")]
    Transport(String),

    #[error("Job slot is occupied by {running}")]
    JobSlotOccupied { running: String },

    #[error("Worker is shutting down")]
    ShuttingDown,
}

impl CompactionError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompactionError::Transport(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, CompactionError::Cancelled)
    }
}

impl From<derive_builder::UninitializedFieldError> for CompactionError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        CompactionError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CompactionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(CompactionError::Transport("connection reset".to_owned()).is_retryable());
        assert!(!CompactionError::Merge("corrupt block".to_owned()).is_retryable());
        assert!(!CompactionError::Cancelled.is_retryable());
        assert!(
            !CompactionError::TooManyFiles {
                tablet: "1;m;a".to_owned()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_too_many_files_message_names_tablet() {
        let err = CompactionError::TooManyFiles {
            tablet: "2<".to_owned(),
        };
        assert_eq!(err.to_string(), "Too many files queued for tablet 2<");
    }
}
