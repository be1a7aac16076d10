//! Redis plumbing for a coordinator worker.
//!
//! Each worker leases a numbered slot, pops jobs from the queue bound to
//! that slot, and publishes job results and sandbox events back.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::jobs::{JobResult, WorkerJob};

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "coordinator:worker:lease:";

    /// Per-worker job queue prefix. Interactive sessions are pinned to the
    /// worker that holds their sandbox, so each worker has its own queue.
    pub const QUEUE_PREFIX: &str = "coordinator:queue:";

    /// Job result key prefix (for polling)
    pub const RESULT_PREFIX: &str = "coordinator:result:";

    /// Job result channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "coordinator:results";

    /// Per-worker event channel prefix (status, file exports, phase changes)
    pub const EVENTS_PREFIX: &str = "coordinator:events:";
}

/// Configuration constants
const MAX_WORKERS: u32 = 10;
const WORKER_LEASE_TTL_SECS: u64 = 120;
const CONNECT_RETRY_SECS: u64 = 3;
const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Centralized Redis manager for all Redis operations
pub struct RedisManager {
    worker_id: u32,
    client: redis::Client,
    conn: MultiplexedConnection,
    lease_handle: JoinHandle<()>,
}

impl RedisManager {
    /// Create a new RedisManager with the given Redis URL.
    ///
    /// This will:
    /// 1. Connect to Redis
    /// 2. Allocate a unique worker ID (0 to MAX_WORKERS-1)
    /// 3. Start a background task to keep the worker lease alive
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        let worker_id = allocate_worker_id(&client).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            worker_id, WORKER_LEASE_TTL_SECS
        );

        let lease_handle = spawn_lease_heartbeat(client.clone(), worker_id);

        Ok(Self {
            worker_id,
            client,
            conn,
            lease_handle,
        })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// Get the allocated worker ID
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn queue_key(&self) -> String {
        queue_key(self.worker_id)
    }

    /// Open a separate connection for results and events.
    ///
    /// BLPOP blocks its connection, so job handlers running while the loop
    /// waits for the next job must not share it.
    pub async fn result_store(&self) -> Result<ResultStore> {
        let conn = get_connection_with_retry(&self.client).await?;
        Ok(ResultStore {
            worker_id: self.worker_id,
            client: self.client.clone(),
            conn,
        })
    }

    /// Block and wait for the next job from this worker's queue.
    ///
    /// This uses BLPOP to efficiently wait for jobs without polling.
    /// Automatically reconnects on connection failure.
    pub async fn pop_job(&mut self) -> Result<WorkerJob> {
        let queue = self.queue_key();
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(&queue, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.conn = get_connection_with_retry(&self.client).await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<WorkerJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }
}

impl Drop for RedisManager {
    fn drop(&mut self) {
        self.lease_handle.abort();
    }
}

/// Stores job results and publishes coordinator events
#[derive(Clone)]
pub struct ResultStore {
    worker_id: u32,
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl ResultStore {
    /// Store a job result in Redis.
    ///
    /// The result is stored with a 1-hour expiration and also published
    /// to a channel for real-time subscribers.
    pub async fn store_result(&mut self, result: &JobResult) -> Result<()> {
        let key = format!("{}{}", keys::RESULT_PREFIX, result.request_id);
        let json = serde_json::to_string(result)?;

        // Try to store, reconnect on failure
        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::RESULT_CHANNEL, &json)
            .await;

        Ok(())
    }

    /// Publish a coordinator event on this worker's event channel
    pub async fn publish_event<T: Serialize>(&mut self, event: &T) -> Result<()> {
        let json = serde_json::to_string(event)?;
        let channel = format!("{}{}", keys::EVENTS_PREFIX, self.worker_id);

        if let Err(e) = self.conn.publish::<_, _, ()>(&channel, &json).await {
            warn!("Failed to publish event: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn.publish::<_, _, ()>(&channel, &json).await?;
        }
        Ok(())
    }

    /// Reconnect to Redis
    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

pub fn queue_key(worker_id: u32) -> String {
    format!("{}{}", keys::QUEUE_PREFIX, worker_id)
}

fn lease_key(worker_id: u32) -> String {
    format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id)
}

/// Connect to Redis, waiting out outages instead of failing the worker
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Redis unavailable ({}), retrying in {}s",
                    e, CONNECT_RETRY_SECS
                );
                tokio::time::sleep(Duration::from_secs(CONNECT_RETRY_SECS)).await;
            }
        }
    }
}

/// Claim the first free coordinator slot. The lease value records the
/// claiming process so a stuck slot can be traced to its owner.
async fn allocate_worker_id(client: &redis::Client) -> Result<u32> {
    let owner = format!("pid:{}", std::process::id());
    let mut conn = get_connection_with_retry(client).await?;
    loop {
        for worker_id in 0..MAX_WORKERS {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(lease_key(worker_id))
                .arg(&owner)
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS)
                .query_async(&mut conn)
                .await?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "All {} coordinator slots are leased, waiting for one to expire",
            MAX_WORKERS
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Keep the slot lease alive while this coordinator owns its sandbox.
/// The connection is reused between refreshes and rebuilt only after a failure.
fn spawn_lease_heartbeat(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = lease_key(worker_id);
        let mut conn: Option<MultiplexedConnection> = None;

        loop {
            tokio::time::sleep(Duration::from_secs(WORKER_LEASE_TTL_SECS / 2)).await;

            if conn.is_none() {
                match get_connection_with_retry(&client).await {
                    Ok(fresh) => conn = Some(fresh),
                    Err(e) => {
                        warn!("Lease {} not refreshed: {}", key, e);
                        continue;
                    }
                }
            }
            let Some(active) = conn.as_mut() else {
                continue;
            };

            let refreshed: redis::RedisResult<bool> = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(WORKER_LEASE_TTL_SECS)
                .query_async(active)
                .await;
            match refreshed {
                Ok(true) => {}
                Ok(false) => warn!("Lease {} had already expired", key),
                Err(e) => {
                    warn!("Lease {} not refreshed: {}", key, e);
                    conn = None;
                }
            }
        }
    })
}
