//! Execution context submitted for a single run

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::utils::is_safe_path;
use crate::error::CoordinatorError;

/// A source editor written into the sandbox filesystem as a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Editor {
    /// File name inside the sandbox (e.g., "main.py")
    pub id: String,
    pub code: String,
}

impl Editor {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
        }
    }
}

/// Display theme used by the sandbox when rendering graphics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Light,
    Dark,
}

/// Opaque token pairing a test-mode request with its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the sandbox needs to execute one request.
///
/// Owned by exactly one in-flight run; the coordinator never mutates a
/// submitted context, it builds new ones (e.g. when resuming input).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub editors: Vec<Editor>,
    /// Editors not shown to the student, keyed by file name
    #[serde(default)]
    pub hidden_editors: BTreeMap<String, String>,
    /// Dataset name -> JSON content (None when the dataset is declared but empty)
    #[serde(default)]
    pub datasets: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub mode: DisplayMode,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl ExecutionContext {
    #[cfg(test)]
    pub fn new(editors: impl IntoIterator<Item = Editor>) -> Self {
        Self {
            editors: editors.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    #[cfg(test)]
    pub fn with_mode(mut self, mode: DisplayMode) -> Self {
        self.mode = mode;
        self
    }

    #[cfg(test)]
    pub fn with_hidden_editor(mut self, id: impl Into<String>, code: impl Into<String>) -> Self {
        self.hidden_editors.insert(id.into(), code.into());
        self
    }

    #[cfg(test)]
    pub fn with_dataset(mut self, name: impl Into<String>, content: Option<String>) -> Self {
        self.datasets.insert(name.into(), content);
        self
    }

    /// Visible editors followed by hidden ones, in the order they are written
    pub fn all_editors(&self) -> Vec<Editor> {
        let mut editors = self.editors.clone();
        editors.extend(
            self.hidden_editors
                .iter()
                .map(|(id, code)| Editor::new(id.clone(), code.clone())),
        );
        editors
    }

    pub fn find_editor(&self, id: &str) -> Option<&Editor> {
        self.editors.iter().find(|editor| editor.id == id)
    }

    /// Reject contexts the sandbox cannot execute
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.editors.is_empty() {
            return Err(CoordinatorError::InvalidContext(
                "no editors provided for execution".to_string(),
            ));
        }
        let names = self
            .editors
            .iter()
            .map(|editor| editor.id.as_str())
            .chain(self.hidden_editors.keys().map(String::as_str))
            .chain(self.datasets.keys().map(String::as_str));
        for name in names {
            if !is_safe_path(name) {
                return Err(CoordinatorError::InvalidContext(format!(
                    "unsafe file name: {:?}",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Snapshot of this context without its inputs, kept while waiting for
    /// interactive input
    pub fn resume_context(&self) -> ResumeContext {
        ResumeContext {
            editors: self.editors.clone(),
            hidden_editors: self.hidden_editors.clone(),
            datasets: self.datasets.clone(),
            mode: self.mode,
        }
    }
}

/// An execution context minus its inputs
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeContext {
    pub editors: Vec<Editor>,
    pub hidden_editors: BTreeMap<String, String>,
    pub datasets: BTreeMap<String, Option<String>>,
    pub mode: DisplayMode,
}

impl ResumeContext {
    /// Build a fresh interactive context carrying only the given inputs
    pub fn into_context(self, inputs: Vec<String>) -> ExecutionContext {
        ExecutionContext {
            editors: self.editors,
            hidden_editors: self.hidden_editors,
            datasets: self.datasets,
            mode: self.mode,
            inputs,
            test_mode: false,
            correlation_id: None,
        }
    }
}
