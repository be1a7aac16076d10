//! Coordinator configuration
//!
//! Loaded from a TOML file (`COORDINATOR_CONFIG`, default
//! `./files/coordinator.toml`). Missing files fall back to defaults.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::engine::coordinator::CoordinatorSettings;

const DEFAULT_CONFIG_PATH: &str = "./files/coordinator.toml";
const DEFAULT_COMMAND: &str = "python3 -u sandbox_host.py";
const DEFAULT_LOAD_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CASE_TIMEOUT_MS: u64 = 4_000;

/// Sandbox process settings
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Interpreter host command line, already split into program + args
    pub command: Vec<String>,
    /// Packages installed on every load
    pub packages: BTreeSet<String>,
    pub load_timeout_ms: u64,
    /// Interactive runs longer than this are interrupted (None = unbounded)
    pub run_timeout_ms: Option<u64>,
    /// Parent directory for per-instance scratch directories
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub sandbox: SandboxConfig,
    /// Deadline applied to each test case by the harness
    pub case_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig {
                command: into_command(DEFAULT_COMMAND),
                packages: BTreeSet::new(),
                load_timeout_ms: DEFAULT_LOAD_TIMEOUT_MS,
                run_timeout_ms: None,
                work_dir: None,
            },
            case_timeout_ms: DEFAULT_CASE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    sandbox: RawSandboxConfig,
    #[serde(default)]
    harness: RawHarnessConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawSandboxConfig {
    command: Option<String>,
    #[serde(default)]
    packages: Vec<String>,
    load_timeout_ms: Option<u64>,
    run_timeout_ms: Option<u64>,
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHarnessConfig {
    case_timeout_ms: Option<u64>,
}

impl CoordinatorConfig {
    /// Load from `COORDINATOR_CONFIG` (or the default path)
    pub fn from_env() -> anyhow::Result<Self> {
        let path =
            std::env::var("COORDINATOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load(&path)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Coordinator config {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let defaults = Self::default();

        let command = match raw.sandbox.command {
            Some(cmd) => into_command(&cmd),
            None => defaults.sandbox.command,
        };
        if command.is_empty() {
            anyhow::bail!("sandbox.command must not be empty");
        }

        let load_timeout_ms = raw
            .sandbox
            .load_timeout_ms
            .unwrap_or(DEFAULT_LOAD_TIMEOUT_MS);
        let case_timeout_ms = raw
            .harness
            .case_timeout_ms
            .unwrap_or(DEFAULT_CASE_TIMEOUT_MS);
        if load_timeout_ms == 0 || case_timeout_ms == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }

        Ok(Self {
            sandbox: SandboxConfig {
                command,
                packages: raw.sandbox.packages.into_iter().collect(),
                load_timeout_ms,
                run_timeout_ms: raw.sandbox.run_timeout_ms.filter(|ms| *ms > 0),
                work_dir: raw.sandbox.work_dir,
            },
            case_timeout_ms,
        })
    }

    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            load_timeout: Duration::from_millis(self.sandbox.load_timeout_ms),
            run_timeout: self.sandbox.run_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
