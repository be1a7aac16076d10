mod config;
mod core;
mod engine;
mod error;
mod exercises;
mod harness;
mod jobs;
mod redis_manager;
mod storage;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::CoordinatorConfig;
use crate::engine::{Coordinator, CoordinatorEvent, ProcessLauncher};
use crate::exercises::ExerciseRegistry;
use crate::harness::TestHarness;
use crate::jobs::{process_job, JobContext};
use crate::redis_manager::{RedisManager, ResultStore};
use crate::storage::StorageClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandbox_coordinator=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = CoordinatorConfig::from_env()?;
    info!(
        "Sandbox command: {:?}, packages: {:?}",
        config.sandbox.command, config.sandbox.packages
    );

    let registry = Arc::new(ExerciseRegistry::from_env()?);

    info!("Starting Sandbox Coordinator...");

    let mut redis = RedisManager::from_env().await?;
    let worker_id = redis.worker_id();
    let store = redis.result_store().await?;

    let storage = StorageClient::from_env().await?;
    info!("Connected to MinIO storage");

    let launcher = Arc::new(ProcessLauncher::from_config(&config.sandbox)?);
    let coordinator = Coordinator::new(launcher, config.settings());
    let harness = TestHarness::new(coordinator.clone(), config.case_timeout());

    let _event_handle = tokio::spawn(forward_events(
        coordinator.clone(),
        store.clone(),
        storage,
        worker_id,
    ));

    // A failed initial load is not fatal; a load job can retry it
    if let Err(e) = coordinator.load(config.sandbox.packages.clone()).await {
        error!("Initial sandbox load failed: {}", e);
    }

    let ctx = JobContext {
        coordinator: coordinator.clone(),
        harness,
        registry,
        default_packages: config.sandbox.packages.clone(),
    };

    info!("Waiting for jobs on {}...", redis.queue_key());

    loop {
        let job = tokio::select! {
            job = redis.pop_job() => job?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                coordinator.shutdown();
                break;
            }
        };

        // Handlers run on their own tasks so an interrupt can be served while
        // a run is still waiting on the sandbox
        let ctx = ctx.clone();
        let mut store = store.clone();
        tokio::spawn(async move {
            let result = process_job(job, &ctx).await;
            if let Err(e) = store.store_result(&result).await {
                error!(
                    "Failed to store result for request {}: {}",
                    result.request_id, e
                );
            }
        });
    }

    Ok(())
}

/// Publish coordinator events to Redis, uploading exported files first
async fn forward_events(
    coordinator: Coordinator,
    mut store: ResultStore,
    storage: StorageClient,
    worker_id: u32,
) {
    let mut events = coordinator.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event forwarder lagged, skipped {} event(s)", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let published = match &event {
            CoordinatorEvent::FileExport { file_name, data } => {
                match storage
                    .upload_export(worker_id, file_name, data.clone())
                    .await
                {
                    Ok(key) => {
                        store
                            .publish_event(&serde_json::json!({
                                "event": "file_export",
                                "file_name": file_name,
                                "key": key,
                            }))
                            .await
                    }
                    Err(e) => {
                        error!("Failed to upload exported file {}: {:#}", file_name, e);
                        continue;
                    }
                }
            }
            other => store.publish_event(other).await,
        };

        if let Err(e) = published {
            warn!("Failed to publish coordinator event: {}", e);
        }
    }
}
