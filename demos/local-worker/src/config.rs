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

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tablet_compactor_core::WorkerConfig;
use tablet_compactor_core::merger::DEFAULT_BATCH_ENTRIES;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Local directory backing the volume.
    pub root: PathBuf,
    /// Volume path under which each table has a directory of tablet directories.
    pub tables_dir: PathBuf,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            tables_dir: PathBuf::from("/tables"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    pub batch_entries: usize,
    pub propagate_deletes: bool,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            batch_entries: DEFAULT_BATCH_ENTRIES,
            propagate_deletes: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub volume: VolumeConfig,
    pub merger: MergerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.worker.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = Config::from_yaml(
            r#"
worker:
  worker_id: w7
  cancel_check_interval_ms: 2000
  status_retry:
    max_attempts: 3
volume:
  root: /var/lib/compactor
logging:
  level: debug
"#,
        )
        .unwrap();

        assert_eq!(config.worker.worker_id, "w7");
        assert_eq!(config.worker.cancel_check_interval_ms, 2000);
        assert_eq!(config.worker.status_retry.max_attempts, 3);
        assert_eq!(config.worker.status_retry.initial_delay_ms, 100);
        assert_eq!(config.worker.idle_poll_interval_ms, 1000);
        assert_eq!(config.volume.root, PathBuf::from("/var/lib/compactor"));
        assert_eq!(config.volume.tables_dir, PathBuf::from("/tables"));
        assert_eq!(config.merger.batch_entries, DEFAULT_BATCH_ENTRIES);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_worker_config_is_rejected() {
        let result = Config::from_yaml(
            r#"
worker:
  status_retry:
    max_attempts: 0
"#,
        );
        assert!(result.is_err());
    }
}
