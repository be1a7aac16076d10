//! Test harness
//!
//! Runs test cases one after another through the coordinator's correlated
//! request path, each with its own deadline. Two suite policies exist:
//! strict (stop at the first failure, pass only if every case holds) and
//! any-match (run everything, pass if at least one case holds).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{ExecutionContext, FailureReason};
use crate::engine::coordinator::{Coordinator, CorrelatedReply, INPUT_OVERRUN_MESSAGE};
use crate::error::CoordinatorError;

pub const ASSERTION_DETAILS: &str = "output does not meet the case criterion";
pub const TIMEOUT_DETAILS: &str = "time limit exceeded";

#[cfg(test)]
pub type Predicate = std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// What a case's output must satisfy
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    Contains(String),
    NotContains(String),
    /// Line-wise comparison, ignoring trailing whitespace and blank tail lines
    Equals(String),
    AllOf(Vec<Expectation>),
    AnyOf(Vec<Expectation>),
    /// In-process predicate for tests; cannot be serialized
    #[cfg(test)]
    #[serde(skip)]
    Custom(Predicate),
}

impl Expectation {
    #[cfg(test)]
    pub fn custom(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Expectation::Custom(std::sync::Arc::new(predicate))
    }

    pub fn holds(&self, output: &str) -> bool {
        match self {
            Expectation::Contains(needle) => output.contains(needle.as_str()),
            Expectation::NotContains(needle) => !output.contains(needle.as_str()),
            Expectation::Equals(expected) => compare_output(output, expected),
            Expectation::AllOf(all) => all.iter().all(|e| e.holds(output)),
            Expectation::AnyOf(any) => any.iter().any(|e| e.holds(output)),
            #[cfg(test)]
            Expectation::Custom(predicate) => predicate(output),
        }
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Contains(s) => f.debug_tuple("Contains").field(s).finish(),
            Expectation::NotContains(s) => f.debug_tuple("NotContains").field(s).finish(),
            Expectation::Equals(s) => f.debug_tuple("Equals").field(s).finish(),
            Expectation::AllOf(all) => f.debug_tuple("AllOf").field(all).finish(),
            Expectation::AnyOf(any) => f.debug_tuple("AnyOf").field(any).finish(),
            #[cfg(test)]
            Expectation::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Compare program output against an expected answer, ignoring trailing
/// whitespace on each line and trailing empty lines
pub fn compare_output(actual: &str, expected: &str) -> bool {
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };
    normalize(actual) == normalize(expected)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub expect: Expectation,
}

impl TestCase {
    #[cfg(test)]
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        expect: Expectation,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            expect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuitePolicy {
    #[default]
    Strict,
    AnyMatch,
}

/// How a single case execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum CaseRun {
    Output(String),
    Timeout,
    RuntimeError { message: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseFailure {
    pub case: String,
    pub reason: FailureReason,
    pub details: String,
    pub student_output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    Output,
    Timeout,
    Error,
}

/// Per-case record kept by any-match suites
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseOutcome {
    pub name: String,
    pub ok: bool,
    pub kind: CaseKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SuiteResult {
    Strict {
        passed: bool,
        #[serde(flatten)]
        failure: Option<CaseFailure>,
    },
    AnyMatch {
        passed: bool,
        results: Vec<CaseOutcome>,
    },
}

impl SuiteResult {
    pub fn passed(&self) -> bool {
        match self {
            SuiteResult::Strict { passed, .. } | SuiteResult::AnyMatch { passed, .. } => *passed,
        }
    }

    #[cfg(test)]
    pub fn failure(&self) -> Option<&CaseFailure> {
        match self {
            SuiteResult::Strict { failure, .. } => failure.as_ref(),
            SuiteResult::AnyMatch { .. } => None,
        }
    }
}

/// Human-readable report for the output console
impl fmt::Display for SuiteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuiteResult::Strict { failure: None, .. } => write!(f, "All cases passed."),
            SuiteResult::Strict {
                failure: Some(failure),
                ..
            } => {
                write!(f, "Failed case: {}", failure.case)?;
                write!(f, "\n- Reason: {}", failure.reason)?;
                if !failure.details.is_empty() {
                    write!(f, "\n- Details: {}", failure.details)?;
                }
                if !failure.student_output.is_empty() {
                    write!(f, "\n- Student output:\n{}", failure.student_output)?;
                }
                Ok(())
            }
            SuiteResult::AnyMatch { passed, results } => {
                let matched = results.iter().filter(|r| r.ok).count();
                write!(
                    f,
                    "{} of {} cases matched ({})",
                    matched,
                    results.len(),
                    if *passed { "passed" } else { "failed" }
                )?;
                for result in results {
                    let mark = if result.ok { "PASS" } else { "FAIL" };
                    write!(f, "\n[{}] {}", mark, result.name)?;
                    if let Some(error) = &result.error {
                        write!(f, ": {}", error)?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct TestHarness {
    coordinator: Coordinator,
    case_timeout: Duration,
}

impl TestHarness {
    pub fn new(coordinator: Coordinator, case_timeout: Duration) -> Self {
        Self {
            coordinator,
            case_timeout,
        }
    }

    /// Run one test-mode execution with a deadline.
    ///
    /// Runtime errors, undecodable replies and timeouts are outcomes; only
    /// lifecycle failures (reset, sandbox not ready) are returned as errors.
    pub async fn run_one(
        &self,
        context: ExecutionContext,
        deadline: Duration,
    ) -> Result<CaseRun, CoordinatorError> {
        match self.coordinator.run_correlated(context, deadline).await {
            Ok(CorrelatedReply::Output(output)) => Ok(CaseRun::Output(output.text)),
            Ok(CorrelatedReply::Error(payload)) => Ok(CaseRun::RuntimeError {
                message: payload.message().to_string(),
                output: payload.captured_output().to_string(),
            }),
            Ok(CorrelatedReply::InputRequested { prompt }) => Ok(CaseRun::RuntimeError {
                message: INPUT_OVERRUN_MESSAGE.to_string(),
                output: prompt,
            }),
            Err(CoordinatorError::Timeout) => Ok(CaseRun::Timeout),
            Err(CoordinatorError::Protocol(e)) => Ok(CaseRun::RuntimeError {
                message: e.to_string(),
                output: String::new(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Strict suite: stop at the first case that fails
    pub async fn run_suite(
        &self,
        cases: &[TestCase],
        template: &ExecutionContext,
    ) -> Result<SuiteResult, CoordinatorError> {
        for case in cases {
            let run = self.run_case(case, template).await?;
            let failure = match run {
                CaseRun::Output(output) if case.expect.holds(&output) => {
                    debug!("Case {} passed", case.name);
                    continue;
                }
                CaseRun::Output(output) => CaseFailure {
                    case: case.name.clone(),
                    reason: FailureReason::AssertionFailed,
                    details: ASSERTION_DETAILS.to_string(),
                    student_output: output,
                },
                CaseRun::Timeout => CaseFailure {
                    case: case.name.clone(),
                    reason: FailureReason::Timeout,
                    details: TIMEOUT_DETAILS.to_string(),
                    student_output: String::new(),
                },
                CaseRun::RuntimeError { message, output } => CaseFailure {
                    case: case.name.clone(),
                    reason: FailureReason::RuntimeError,
                    details: message,
                    student_output: output,
                },
            };
            info!("Case {} failed: {}", failure.case, failure.reason);
            return Ok(SuiteResult::Strict {
                passed: false,
                failure: Some(failure),
            });
        }

        info!("All {} cases passed", cases.len());
        Ok(SuiteResult::Strict {
            passed: true,
            failure: None,
        })
    }

    /// Any-match suite: run every case, pass if at least one holds
    pub async fn run_suite_all(
        &self,
        cases: &[TestCase],
        template: &ExecutionContext,
    ) -> Result<SuiteResult, CoordinatorError> {
        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            let outcome = match self.run_case(case, template).await? {
                CaseRun::Output(output) => CaseOutcome {
                    name: case.name.clone(),
                    ok: case.expect.holds(&output),
                    kind: CaseKind::Output,
                    error: None,
                    output,
                },
                CaseRun::Timeout => CaseOutcome {
                    name: case.name.clone(),
                    ok: false,
                    kind: CaseKind::Timeout,
                    error: Some(TIMEOUT_DETAILS.to_string()),
                    output: String::new(),
                },
                CaseRun::RuntimeError { message, output } => CaseOutcome {
                    name: case.name.clone(),
                    ok: false,
                    kind: CaseKind::Error,
                    error: Some(message),
                    output,
                },
            };
            results.push(outcome);
        }

        let passed = results.iter().any(|r| r.ok);
        info!(
            "{} of {} cases matched",
            results.iter().filter(|r| r.ok).count(),
            results.len()
        );
        Ok(SuiteResult::AnyMatch { passed, results })
    }

    pub async fn run_test_suite(
        &self,
        cases: &[TestCase],
        template: &ExecutionContext,
        policy: SuitePolicy,
    ) -> Result<SuiteResult, CoordinatorError> {
        match policy {
            SuitePolicy::Strict => self.run_suite(cases, template).await,
            SuitePolicy::AnyMatch => self.run_suite_all(cases, template).await,
        }
    }

    async fn run_case(
        &self,
        case: &TestCase,
        template: &ExecutionContext,
    ) -> Result<CaseRun, CoordinatorError> {
        let context = template
            .clone()
            .with_inputs(case.inputs.clone())
            .with_test_mode(true);
        self.run_one(context, self.case_timeout).await
    }
}
