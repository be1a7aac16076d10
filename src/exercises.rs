//! Exercise registry
//!
//! Maps exercise ids (and aliases) to the editor holding the student's code
//! and the test cases that validate it. Loaded from a TOML file
//! (`EXERCISES_CONFIG`, default `./files/exercises.toml`).

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::ExecutionContext;
use crate::error::CoordinatorError;
use crate::harness::{SuitePolicy, SuiteResult, TestCase, TestHarness};

const DEFAULT_EXERCISES_PATH: &str = "./files/exercises.toml";

#[derive(Debug, Clone)]
pub struct Exercise {
    pub id: String,
    /// Editor id whose code is under test (e.g., "main.py")
    pub main_editor: String,
    pub policy: SuitePolicy,
    pub cases: Vec<TestCase>,
}

impl Exercise {
    /// Fail unless the submitted context contains this exercise's main editor
    pub fn check_editors(&self, context: &ExecutionContext) -> Result<(), CoordinatorError> {
        if context.find_editor(&self.main_editor).is_some() {
            return Ok(());
        }
        let provided: Vec<&str> = context.editors.iter().map(|e| e.id.as_str()).collect();
        Err(CoordinatorError::InvalidContext(format!(
            "main editor not found: expected \"{}\", got: {}",
            self.main_editor,
            provided.join(", ")
        )))
    }
}

#[derive(Debug, Deserialize)]
struct RawExercise {
    main_editor: String,
    #[serde(default)]
    policy: SuitePolicy,
    #[serde(default)]
    cases: Vec<TestCase>,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    exercises: HashMap<String, RawExercise>,
}

#[derive(Debug, Clone, Default)]
pub struct ExerciseRegistry {
    exercises: HashMap<String, Arc<Exercise>>,
}

impl ExerciseRegistry {
    pub fn from_env() -> anyhow::Result<Self> {
        let path =
            std::env::var("EXERCISES_CONFIG").unwrap_or_else(|_| DEFAULT_EXERCISES_PATH.into());
        Self::load(&path)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Exercise registry {} not found, starting empty", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read exercise registry: {}", path.display()))?;
        let registry = Self::parse(&content)
            .with_context(|| format!("Invalid exercise registry: {}", path.display()))?;
        if registry.is_empty() {
            warn!("Exercise registry {} defines no exercises", path.display());
        } else {
            info!("Loaded {} exercise(s) from {}", registry.len(), path.display());
        }
        Ok(registry)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw: RawRegistry = toml::from_str(content)?;
        let mut exercises = HashMap::new();

        for (id, raw) in raw.exercises {
            if raw.main_editor.trim().is_empty() {
                anyhow::bail!("Exercise {} has an empty main_editor", id);
            }
            let exercise = Arc::new(Exercise {
                id: id.clone(),
                main_editor: raw.main_editor,
                policy: raw.policy,
                cases: raw.cases,
            });

            for name in std::iter::once(id.clone()).chain(raw.aliases) {
                if let Some(previous) = exercises.insert(name.to_lowercase(), exercise.clone()) {
                    anyhow::bail!(
                        "Exercise name {} of {} collides with {}",
                        name,
                        id,
                        previous.id
                    );
                }
            }
        }

        Ok(Self { exercises })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Exercise>> {
        self.exercises.get(&id.to_lowercase()).cloned()
    }

    /// Number of ids and aliases known to the registry
    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub exercise_id: String,
    pub status: ValidationStatus,
    pub message: String,
    pub failure_reasons: Vec<String>,
    pub suite: SuiteResult,
}

/// Run an exercise's cases against the submitted editors.
///
/// `policy` overrides the exercise's own suite policy when given.
pub async fn validate_exercise(
    harness: &TestHarness,
    registry: &ExerciseRegistry,
    exercise_id: &str,
    template: &ExecutionContext,
    policy: Option<SuitePolicy>,
) -> Result<ValidationReport, CoordinatorError> {
    let exercise = registry.get(exercise_id).ok_or_else(|| {
        CoordinatorError::InvalidContext(format!("exercise not found: {}", exercise_id))
    })?;
    exercise.check_editors(template)?;

    let suite = harness
        .run_test_suite(
            &exercise.cases,
            template,
            policy.unwrap_or(exercise.policy),
        )
        .await?;

    let (status, message) = if suite.passed() {
        (ValidationStatus::Success, "Exercise completed")
    } else {
        (ValidationStatus::Failure, "Exercise is incomplete")
    };
    let failure_reasons = if suite.passed() {
        Vec::new()
    } else {
        vec![suite.to_string()]
    };

    info!("Exercise {} validated: {:?}", exercise.id, status);
    Ok(ValidationReport {
        exercise_id: exercise.id.clone(),
        status,
        message: message.to_string(),
        failure_reasons,
        suite,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Editor;
    use crate::testing::{loaded_coordinator, program};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const REGISTRY: &str = r#"
[exercises.echo-number]
main_editor = "main.py"
aliases = ["Echo"]

[[exercises.echo-number.cases]]
name = "five"
inputs = ["5"]
expect = { contains = "5" }

[[exercises.echo-number.cases]]
name = "exact"
inputs = ["42"]
expect = { equals = "42" }

[exercises.guess]
main_editor = "main.py"
policy = "any-match"

[[exercises.guess.cases]]
name = "miss"
inputs = ["1"]
expect = { contains = "7" }

[[exercises.guess.cases]]
name = "hit"
inputs = ["7"]
expect = { all_of = [{ contains = "7" }, { not_contains = "Traceback" }] }
"#;

    #[test]
    fn test_parse_registry_with_aliases() {
        let registry = ExerciseRegistry::parse(REGISTRY).unwrap();
        assert_eq!(registry.len(), 3);

        let exercise = registry.get("echo").unwrap();
        assert_eq!(exercise.id, "echo-number");
        assert_eq!(exercise.cases.len(), 2);
        assert_eq!(exercise.policy, SuitePolicy::Strict);
        assert_eq!(registry.get("GUESS").unwrap().policy, SuitePolicy::AnyMatch);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_parse_rejects_alias_collision() {
        let content = r#"
[exercises.a]
main_editor = "main.py"
aliases = ["b"]

[exercises.b]
main_editor = "main.py"
"#;
        assert!(ExerciseRegistry::parse(content).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", REGISTRY).unwrap();
        let registry = ExerciseRegistry::load(file.path()).unwrap();
        assert!(registry.get("echo-number").is_some());

        assert!(ExerciseRegistry::load("/nonexistent/exercises.toml")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_check_editors_names_expected_editor() {
        let registry = ExerciseRegistry::parse(REGISTRY).unwrap();
        let exercise = registry.get("echo-number").unwrap();
        let context = ExecutionContext::new([Editor::new("solution.py", "echo")]);

        match exercise.check_editors(&context) {
            Err(CoordinatorError::InvalidContext(message)) => {
                assert!(message.contains("\"main.py\""));
                assert!(message.contains("solution.py"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validate_exercise() {
        let (coordinator, _) = loaded_coordinator().await;
        let harness = TestHarness::new(coordinator, Duration::from_secs(5));
        let registry = ExerciseRegistry::parse(REGISTRY).unwrap();

        let report = validate_exercise(&harness, &registry, "echo", &program("echo"), None)
            .await
            .unwrap();
        assert_eq!(report.status, ValidationStatus::Success);
        assert!(report.failure_reasons.is_empty());

        let report = validate_exercise(&harness, &registry, "guess", &program("echo"), None)
            .await
            .unwrap();
        assert_eq!(report.status, ValidationStatus::Success);

        // Forcing strict on the any-match exercise fails on the first miss
        let report = validate_exercise(
            &harness,
            &registry,
            "guess",
            &program("echo"),
            Some(SuitePolicy::Strict),
        )
        .await
        .unwrap();
        assert_eq!(report.status, ValidationStatus::Failure);
        assert!(report.failure_reasons[0].contains("Failed case: miss"));

        assert!(matches!(
            validate_exercise(&harness, &registry, "nope", &program("echo"), None).await,
            Err(CoordinatorError::InvalidContext(_))
        ));
    }
}
