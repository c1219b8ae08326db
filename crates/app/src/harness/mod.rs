use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::{config::HarnessConfig, unique_id};

pub mod aws;
pub mod cleanup;
pub mod exec;
pub mod log_group;
pub mod probe;
pub mod release;
pub mod teardown;
pub mod terraform;

pub use cleanup::{Cleanup, CleanupError};
pub use exec::{CommandError, CommandOutput, CommandRunner, CommandSpec, RecordingRunner, SystemRunner};
pub use log_group::LogGroup;
pub use probe::{ProbeError, ProbeOutcome, ProbeSpec};
pub use terraform::{Terraform, TerraformOptions};

/// Pins the unique id so reruns reuse the same workspace name.
pub const COUNTER_ENV: &str = "INFRA_TEST_COUNTER";

/// Names derived from one unique id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunNames {
    pub unique_id: String,
    pub workspace: String,
    pub service: String,
}

impl RunNames {
    pub fn new(config: &HarnessConfig, unique_id: String) -> Self {
        let workspace = format!("{}{unique_id}", config.workspace_prefix);
        let service = format!("{workspace}-{}-{}", config.app_name, config.environment);
        Self {
            unique_id,
            workspace,
            service,
        }
    }

    /// Names for a pre-existing workspace, e.g. one left behind by a crashed run.
    pub fn for_workspace(config: &HarnessConfig, workspace: &str) -> Result<Self> {
        let Some(unique_id) = workspace.strip_prefix(config.workspace_prefix.as_str()) else {
            bail!(
                "workspace {workspace} does not start with {}",
                config.workspace_prefix
            );
        };
        if unique_id.is_empty() {
            bail!("workspace {workspace} carries no unique id");
        }
        Ok(Self::new(config, unique_id.to_string()))
    }
}

/// State for a single harness invocation: names, directories and journal.
///
/// Everything is computed once in the constructor and handed to each step
/// explicitly.
pub struct TestRun {
    config: HarnessConfig,
    names: RunNames,
    root: PathBuf,
    logs_dir: PathBuf,
    artifacts_dir: PathBuf,
}

impl TestRun {
    /// Start a run named after the current clock, or after `INFRA_TEST_COUNTER` when set.
    pub fn start(config: HarnessConfig) -> Result<Self> {
        match std::env::var(COUNTER_ENV) {
            Ok(raw) => {
                let counter = raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{COUNTER_ENV} must be a non-negative integer, got {raw:?}"))?;
                Self::with_counter(config, counter)
            }
            Err(_) => {
                let names = RunNames::new(&config, unique_id::from_clock()?);
                Self::with_names(config, names)
            }
        }
    }

    pub fn with_counter(config: HarnessConfig, counter: u64) -> Result<Self> {
        let id = unique_id::encode(counter).to_ascii_lowercase();
        let names = RunNames::new(&config, id);
        Self::with_names(config, names)
    }

    pub fn with_names(config: HarnessConfig, names: RunNames) -> Result<Self> {
        let root = config
            .repo_root
            .as_std_path()
            .join("target")
            .join("infra-test")
            .join(&names.workspace);
        let logs_dir = root.join("logs");
        let artifacts_dir = root.join("artifacts");
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("failed to create logs dir at {}", logs_dir.display()))?;
        fs::create_dir_all(&artifacts_dir).with_context(|| {
            format!(
                "failed to create artifacts dir at {}",
                artifacts_dir.display()
            )
        })?;

        let run = Self {
            config,
            names,
            root,
            logs_dir,
            artifacts_dir,
        };
        write_json(&run.root.join("env.json"), &RunSnapshot::capture(&run))?;
        run.journal(&format!("run started for workspace {}", run.names.workspace))?;
        info!(
            workspace = %run.names.workspace,
            service = %run.names.service,
            root = %run.root.display(),
            "test run prepared"
        );
        Ok(run)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn names(&self) -> &RunNames {
        &self.names
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Append a timestamped line to `logs/harness.log`.
    pub fn journal(&self, line: &str) -> Result<()> {
        let journal = self.logs_dir.join("harness.log");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal)
            .with_context(|| format!("failed to open {}", journal.display()))?;
        writeln!(file, "[{}] {line}", now_millis())
            .with_context(|| format!("failed to write {}", journal.display()))?;
        Ok(())
    }

    pub fn write_artifact(&self, name: &str, value: &impl Serialize) -> Result<PathBuf> {
        let path = self.artifacts_dir.join(name);
        write_json(&path, value)?;
        Ok(path)
    }
}

#[derive(Debug, Serialize)]
struct RunSnapshot {
    names: RunNames,
    root: PathBuf,
    repo_root: String,
    app_name: String,
    environment: String,
    timestamp_ms: u128,
    current_dir: Option<PathBuf>,
    counter_override: Option<String>,
    ci: bool,
}

impl RunSnapshot {
    fn capture(run: &TestRun) -> Self {
        Self {
            names: run.names.clone(),
            root: run.root.clone(),
            repo_root: run.config.repo_root.to_string(),
            app_name: run.config.app_name.clone(),
            environment: run.config.environment.clone(),
            timestamp_ms: now_millis(),
            current_dir: std::env::current_dir().ok(),
            counter_override: std::env::var(COUNTER_ENV).ok(),
            ci: std::env::var_os("CI").is_some(),
        }
    }
}

pub(crate) fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
