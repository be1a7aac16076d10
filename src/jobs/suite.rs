//! Test jobs: caller-supplied suites and registered exercises

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobContext;
use crate::core::ExecutionContext;
use crate::exercises::validate_exercise;
use crate::harness::{SuitePolicy, TestCase};

#[derive(Debug, Serialize, Deserialize)]
pub struct TestSuiteJob {
    pub request_id: String,
    pub cases: Vec<TestCase>,
    /// Editors, datasets and mode shared by every case
    pub template: ExecutionContext,
    #[serde(default)]
    pub policy: SuitePolicy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateExerciseJob {
    pub request_id: String,
    pub exercise_id: String,
    pub context: ExecutionContext,
    /// Overrides the exercise's own policy
    #[serde(default)]
    pub policy: Option<SuitePolicy>,
}

pub async fn process_test_suite_job(job: TestSuiteJob, ctx: &JobContext) -> Result<Value> {
    let result = ctx
        .harness
        .run_test_suite(&job.cases, &job.template, job.policy)
        .await?;
    Ok(serde_json::to_value(result)?)
}

pub async fn process_validate_exercise_job(
    job: ValidateExerciseJob,
    ctx: &JobContext,
) -> Result<Value> {
    let report = validate_exercise(
        &ctx.harness,
        &ctx.registry,
        &job.exercise_id,
        &job.context,
        job.policy,
    )
    .await?;
    Ok(serde_json::to_value(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exercises::ExerciseRegistry;
    use crate::harness::TestHarness;
    use crate::jobs::{process_job, WorkerJob};
    use crate::testing::{loaded_coordinator, packages};
    use std::sync::Arc;
    use std::time::Duration;

    async fn job_context(registry: ExerciseRegistry) -> JobContext {
        let (coordinator, _) = loaded_coordinator().await;
        JobContext {
            harness: TestHarness::new(coordinator.clone(), Duration::from_secs(5)),
            coordinator,
            registry: Arc::new(registry),
            default_packages: packages(&["numpy"]),
        }
    }

    #[tokio::test]
    async fn test_suite_job_reports_strict_failure() {
        let ctx = job_context(ExerciseRegistry::default()).await;
        let job: WorkerJob = serde_json::from_value(serde_json::json!({
            "job_type": "test_suite",
            "request_id": "s1",
            "template": {"editors": [{"id": "main.py", "code": "echo"}]},
            "cases": [
                {"name": "ok", "inputs": ["5"], "expect": {"contains": "5"}},
                {"name": "empty", "inputs": [], "expect": {"contains": "5"}}
            ]
        }))
        .unwrap();

        let result = process_job(job, &ctx).await;
        let outcome = result.outcome.unwrap();
        assert_eq!(outcome["mode"], "strict");
        assert_eq!(outcome["passed"], false);
        assert_eq!(outcome["case"], "empty");
        assert_eq!(outcome["reason"], "runtime-error");
    }

    #[tokio::test]
    async fn test_validate_exercise_job() {
        let registry = ExerciseRegistry::parse(
            r#"
[exercises.double]
main_editor = "main.py"

[[exercises.double.cases]]
name = "four"
inputs = ["4"]
expect = { equals = "4" }
"#,
        )
        .unwrap();
        let ctx = job_context(registry).await;

        let job: WorkerJob = serde_json::from_value(serde_json::json!({
            "job_type": "validate_exercise",
            "request_id": "v1",
            "exercise_id": "double",
            "context": {"editors": [{"id": "main.py", "code": "echo"}]}
        }))
        .unwrap();
        let result = process_job(job, &ctx).await;
        assert!(result.success);
        assert_eq!(result.outcome.unwrap()["status"], "SUCCESS");

        let missing_editor: WorkerJob = serde_json::from_value(serde_json::json!({
            "job_type": "validate_exercise",
            "request_id": "v2",
            "exercise_id": "double",
            "context": {"editors": [{"id": "other.py", "code": "echo"}]}
        }))
        .unwrap();
        let result = process_job(missing_editor, &ctx).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("main editor not found"));
    }
}
