//! Jobs received from the Redis queue and their handlers

pub mod run;
pub mod suite;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::engine::Coordinator;
use crate::exercises::ExerciseRegistry;
use crate::harness::TestHarness;
use crate::jobs::run::{InterruptJob, LoadJob, ProvideInputJob, RunJob};
use crate::jobs::suite::{TestSuiteJob, ValidateExerciseJob};

/// Worker job enum - represents different types of jobs the worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Start (or join) a sandbox load
    #[serde(rename = "load")]
    Load(LoadJob),
    /// Interactive run
    #[serde(rename = "run")]
    Run(RunJob),
    /// Answer a pending interactive prompt
    #[serde(rename = "provide_input")]
    ProvideInput(ProvideInputJob),
    #[serde(rename = "interrupt")]
    Interrupt(InterruptJob),
    /// Run caller-supplied test cases
    #[serde(rename = "test_suite")]
    TestSuite(TestSuiteJob),
    /// Run a registered exercise's test cases
    #[serde(rename = "validate_exercise")]
    ValidateExercise(ValidateExerciseJob),
}

impl WorkerJob {
    pub fn request_id(&self) -> &str {
        match self {
            WorkerJob::Load(job) => &job.request_id,
            WorkerJob::Run(job) => &job.request_id,
            WorkerJob::ProvideInput(job) => &job.request_id,
            WorkerJob::Interrupt(job) => &job.request_id,
            WorkerJob::TestSuite(job) => &job.request_id,
            WorkerJob::ValidateExercise(job) => &job.request_id,
        }
    }

    pub fn job_type(&self) -> &'static str {
        match self {
            WorkerJob::Load(_) => "load",
            WorkerJob::Run(_) => "run",
            WorkerJob::ProvideInput(_) => "provide_input",
            WorkerJob::Interrupt(_) => "interrupt",
            WorkerJob::TestSuite(_) => "test_suite",
            WorkerJob::ValidateExercise(_) => "validate_exercise",
        }
    }
}

/// Result stored for every job, keyed by its request id
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResult {
    pub request_id: String,
    pub job_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Everything a job handler needs
#[derive(Clone)]
pub struct JobContext {
    pub coordinator: Coordinator,
    pub harness: TestHarness,
    pub registry: Arc<ExerciseRegistry>,
    /// Packages loaded when a load job does not name any
    pub default_packages: BTreeSet<String>,
}

/// Process a job and build the result to store
pub async fn process_job(job: WorkerJob, ctx: &JobContext) -> JobResult {
    let request_id = job.request_id().to_string();
    let job_type = job.job_type();
    info!("Received {} job: request_id={}", job_type, request_id);

    let outcome: Result<Value> = match job {
        WorkerJob::Load(job) => run::process_load_job(job, ctx).await,
        WorkerJob::Run(job) => run::process_run_job(job, ctx).await,
        WorkerJob::ProvideInput(job) => run::process_provide_input_job(job, ctx).await,
        WorkerJob::Interrupt(job) => run::process_interrupt_job(job, ctx).await,
        WorkerJob::TestSuite(job) => suite::process_test_suite_job(job, ctx).await,
        WorkerJob::ValidateExercise(job) => suite::process_validate_exercise_job(job, ctx).await,
    };

    match outcome {
        Ok(outcome) => {
            info!("{} job completed: request_id={}", job_type, request_id);
            JobResult {
                request_id,
                job_type: job_type.to_string(),
                success: true,
                outcome: Some(outcome),
                error_message: None,
            }
        }
        Err(e) => {
            error!("Failed to process {} job {}: {:#}", job_type, request_id, e);
            JobResult {
                request_id,
                job_type: job_type.to_string(),
                success: false,
                outcome: None,
                error_message: Some(format!("{:#}", e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{coordinator, packages};
    use std::time::Duration;

    fn job_context() -> JobContext {
        let (coordinator, _) = coordinator();
        JobContext {
            harness: TestHarness::new(coordinator.clone(), Duration::from_secs(5)),
            coordinator,
            registry: Arc::new(ExerciseRegistry::default()),
            default_packages: packages(&["numpy"]),
        }
    }

    fn job(value: serde_json::Value) -> WorkerJob {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_job_deserialization() {
        let run = job(serde_json::json!({
            "job_type": "run",
            "request_id": "r1",
            "context": {"editors": [{"id": "main.py", "code": "print hi"}], "mode": "dark"}
        }));
        assert_eq!(run.request_id(), "r1");
        assert_eq!(run.job_type(), "run");

        let interrupt = job(serde_json::json!({"job_type": "interrupt", "request_id": "r2"}));
        assert!(matches!(interrupt, WorkerJob::Interrupt(_)));

        assert!(serde_json::from_str::<WorkerJob>(r#"{"job_type":"judge","request_id":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_interactive_session_through_jobs() {
        let ctx = job_context();

        let loaded = process_job(job(serde_json::json!({"job_type": "load", "request_id": "l"})), &ctx).await;
        assert!(loaded.success, "{:?}", loaded.error_message);

        let run = process_job(
            job(serde_json::json!({
                "job_type": "run",
                "request_id": "r",
                "context": {"editors": [{"id": "main.py", "code": "print Number?\necho"}]}
            })),
            &ctx,
        )
        .await;
        assert_eq!(
            run.outcome,
            Some(serde_json::json!({"status": "awaiting_input", "prompt": "Number?\n"}))
        );

        let resumed = process_job(
            job(serde_json::json!({"job_type": "provide_input", "request_id": "p", "input": "7"})),
            &ctx,
        )
        .await;
        let outcome = resumed.outcome.unwrap();
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["output"]["text"], "Number?\n7\n");

        let again = process_job(
            job(serde_json::json!({"job_type": "provide_input", "request_id": "p2", "input": "8"})),
            &ctx,
        )
        .await;
        assert!(!again.success);
        assert_eq!(again.error_message.as_deref(), Some("no pending input to provide"));
    }
}
