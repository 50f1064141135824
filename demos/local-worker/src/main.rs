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

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tablet_compactor_core::CompactionExecutor;
use tablet_compactor_core::allocator::TabletFileAllocator;
use tablet_compactor_core::common::InMemoryMetricsRegistry;
use tablet_compactor_core::coordinator::MemoryCoordinator;
use tablet_compactor_core::finalizer::RenameFinalizer;
use tablet_compactor_core::merger::{MergerType, create_merger_factory};
use tablet_compactor_core::volume::LocalVolume;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod config;
mod jobs;

use crate::config::Config;

#[tokio::main]
async fn main() {
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(find_config_file);
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::new(&config.logging.level))
        .init();

    let coordinator = Arc::new(MemoryCoordinator::new());
    match jobs::discover_jobs(
        &config.volume.root,
        &config.volume.tables_dir,
        config.merger.propagate_deletes,
    ) {
        Ok(jobs) => {
            tracing::info!("Queued {} compaction jobs", jobs.len());
            for job in jobs {
                coordinator.add_job(job).await;
            }
        }
        Err(e) => {
            tracing::error!("Failed to scan {}: {}", config.volume.root.display(), e);
            std::process::exit(1);
        }
    }

    let allocator = TabletFileAllocator::new(&config.volume.tables_dir);
    let metrics = InMemoryMetricsRegistry::new();
    let executor = CompactionExecutor::new(
        config.worker,
        coordinator.clone(),
        coordinator,
        Arc::new(LocalVolume::new(&config.volume.root)),
        Arc::new(allocator),
    );
    let executor = match executor {
        Ok(executor) => Arc::new(
            executor
                .with_merger_factory(create_merger_factory(MergerType::Concat {
                    batch_entries: config.merger.batch_entries,
                }))
                .with_finalizer(Arc::new(RenameFinalizer))
                .with_metrics_registry(Box::new(metrics.clone())),
        ),
        Err(e) => {
            tracing::error!("Invalid worker configuration: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        worker_id = executor.worker_id(),
        "Local worker serving {}",
        config.volume.root.display()
    );

    let worker = executor.clone();
    let join_handle = tokio::spawn(async move { worker.run().await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
    executor.shutdown().await;

    match join_handle.await {
        Ok(Ok(())) => {
            tracing::info!("Worker stopped gracefully");
        }
        Ok(Err(e)) => {
            tracing::error!("Worker stopped with error: {}", e);
        }
        Err(e) => {
            tracing::error!("Worker task failed: {}", e);
        }
    }

    for (series, value) in metrics.snapshot() {
        tracing::info!("{} {}", series, value);
    }
}

fn find_config_file() -> PathBuf {
    let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let possible_paths = [
        current_dir.join("config.yaml"),
        current_dir.join("demos/local-worker/config.yaml"),
    ];

    for path in &possible_paths {
        if path.exists() {
            return path.clone();
        }
    }

    current_dir.join("config.yaml")
}
