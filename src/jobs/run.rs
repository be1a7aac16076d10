//! Interactive session jobs: load, run, provide_input, interrupt

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobContext;
use crate::core::ExecutionContext;

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadJob {
    pub request_id: String,
    /// Falls back to the configured package set
    #[serde(default)]
    pub packages: Option<BTreeSet<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunJob {
    pub request_id: String,
    pub context: ExecutionContext,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvideInputJob {
    pub request_id: String,
    pub input: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InterruptJob {
    pub request_id: String,
}

pub async fn process_load_job(job: LoadJob, ctx: &JobContext) -> Result<Value> {
    let packages = job
        .packages
        .unwrap_or_else(|| ctx.default_packages.clone());
    ctx.coordinator.load(packages).await?;
    Ok(serde_json::json!({ "phase": ctx.coordinator.phase() }))
}

pub async fn process_run_job(job: RunJob, ctx: &JobContext) -> Result<Value> {
    let outcome = ctx.coordinator.run(job.context).await?;
    Ok(serde_json::to_value(outcome)?)
}

pub async fn process_provide_input_job(job: ProvideInputJob, ctx: &JobContext) -> Result<Value> {
    let outcome = ctx.coordinator.provide_input(job.input).await?;
    Ok(serde_json::to_value(outcome)?)
}

pub async fn process_interrupt_job(_job: InterruptJob, ctx: &JobContext) -> Result<Value> {
    ctx.coordinator.interrupt().await;
    Ok(serde_json::json!({ "phase": ctx.coordinator.phase() }))
}
