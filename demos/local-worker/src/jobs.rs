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
use std::path::Path;

use tablet_compactor_core::allocator::TABLET_DIR_HINT;
use tablet_compactor_core::volume::TMP_MARKER;
use tablet_compactor_core::{CompactionJob, InputFile, TabletId};

const FILE_EXTENSION: &str = "rf";

/// Builds one job per tablet directory holding at least two finished files,
/// laid out as `<root>/<tables_dir>/<table>/<tablet dir>/*.rf`.
pub fn discover_jobs(
    root: &Path,
    tables_dir: &Path,
    propagate_deletes: bool,
) -> std::io::Result<Vec<CompactionJob>> {
    let tables_root = root.join(tables_dir.strip_prefix("/").unwrap_or(tables_dir));
    let mut jobs = Vec::new();
    if !tables_root.is_dir() {
        return Ok(jobs);
    }

    for table in sorted_dirs(&tables_root)? {
        let Some(table_id) = file_name(&table) else {
            continue;
        };
        for tablet_dir in sorted_dirs(&table)? {
            let Some(dir_name) = file_name(&tablet_dir) else {
                continue;
            };
            let files = input_files(&tablet_dir, &tables_dir.join(&table_id).join(&dir_name))?;
            if files.len() < 2 {
                continue;
            }
            let job = CompactionJob::new(TabletId::whole_table(table_id.clone()), files)
                .with_propagate_deletes(propagate_deletes)
                .with_execution_hint(TABLET_DIR_HINT, dir_name);
            jobs.push(job);
        }
    }
    Ok(jobs)
}

fn sorted_dirs(dir: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
}

/// Finished data files of one tablet directory, addressed by volume path.
fn input_files(dir: &Path, volume_dir: &Path) -> std::io::Result<Vec<InputFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = file_name(&path) else {
            continue;
        };
        let finished = path.extension().is_some_and(|ext| ext == FILE_EXTENSION);
        if !finished || name.contains(TMP_MARKER) {
            continue;
        }
        let data = fs::read(&path)?;
        let entries = data
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .count();
        files.push(InputFile::new(volume_dir.join(&name), data.len() as u64, entries as u64));
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
