use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use super::exec::{CommandError, CommandOutput, CommandRunner, CommandSpec};

pub const DEFAULT_WORKSPACE: &str = "default";

/// Transient failures worth re-running, matched against the command output.
pub const DEFAULT_RETRYABLE_ERRORS: &[(&str, &str)] = &[
    ("Failed to load state", "state backend hiccup"),
    ("Error installing provider", "provider download failure"),
    ("Failed to query available provider packages", "registry unavailable"),
    ("Error acquiring the state lock", "state lock contention"),
    ("timeout while waiting for plugin to start", "plugin startup timeout"),
    ("TLS handshake timeout", "TLS handshake timeout"),
    ("connection reset by peer", "connection reset"),
    ("i/o timeout", "network timeout"),
    ("ThrottlingException", "AWS API throttling"),
    ("RequestError: send request failed", "AWS request failure"),
];

#[derive(Debug, Clone)]
pub struct TerraformOptions {
    pub dir: PathBuf,
    pub vars: BTreeMap<String, String>,
    pub backend_config: Option<String>,
    pub reconfigure: bool,
    pub retryable_errors: Vec<(String, String)>,
    pub max_retries: u32,
    pub sleep_between_retries: Duration,
}

impl TerraformOptions {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            vars: BTreeMap::new(),
            backend_config: None,
            reconfigure: false,
            retryable_errors: Vec::new(),
            max_retries: 0,
            sleep_between_retries: Duration::ZERO,
        }
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn backend_config(mut self, file: impl Into<String>) -> Self {
        self.backend_config = Some(file.into());
        self
    }

    pub fn reconfigure(mut self, reconfigure: bool) -> Self {
        self.reconfigure = reconfigure;
        self
    }

    pub fn with_default_retryable_errors(self) -> Self {
        self.with_retries(3, Duration::from_secs(5))
    }

    /// Install the default retryable error table with a custom retry budget.
    pub fn with_retries(mut self, max_retries: u32, sleep: Duration) -> Self {
        self.retryable_errors = DEFAULT_RETRYABLE_ERRORS
            .iter()
            .map(|(pattern, why)| (pattern.to_string(), why.to_string()))
            .collect();
        self.max_retries = max_retries;
        self.sleep_between_retries = sleep;
        self
    }

    fn retry_reason(&self, err: &CommandError) -> Option<&str> {
        if !matches!(err, CommandError::Failed { .. }) {
            return None;
        }
        let text = err.output_text();
        self.retryable_errors
            .iter()
            .find(|(pattern, _)| text.contains(pattern.as_str()))
            .map(|(_, why)| why.as_str())
    }

    fn var_args(&self) -> Vec<String> {
        self.vars
            .iter()
            .flat_map(|(k, v)| ["-var".to_string(), format!("{k}={v}")])
            .collect()
    }
}

/// Terraform CLI bound to one module directory.
pub struct Terraform<'a> {
    runner: &'a dyn CommandRunner,
    options: TerraformOptions,
}

impl<'a> Terraform<'a> {
    pub fn new(runner: &'a dyn CommandRunner, options: TerraformOptions) -> Self {
        Self { runner, options }
    }

    pub fn options(&self) -> &TerraformOptions {
        &self.options
    }

    pub fn init(&self) -> Result<()> {
        let mut args = vec!["init".to_string(), "-input=false".to_string()];
        if self.options.reconfigure {
            args.push("-reconfigure".into());
        }
        if let Some(backend) = &self.options.backend_config {
            args.push(format!("-backend-config={backend}"));
        }
        self.run(args)?;
        Ok(())
    }

    pub fn workspace_list(&self) -> Result<Vec<String>> {
        let out = self.run(["workspace", "list"])?;
        Ok(parse_workspace_list(&out.stdout)
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    fn current_workspace(&self) -> Result<String> {
        let out = self.run(["workspace", "show"])?;
        Ok(out.stdout.trim().to_string())
    }

    pub fn workspace_select(&self, name: &str) -> Result<()> {
        if !self.workspace_list()?.iter().any(|ws| ws == name) {
            bail!(
                "terraform workspace {name} does not exist in {}",
                self.options.dir.display()
            );
        }
        self.run(["workspace", "select", name])?;
        Ok(())
    }

    pub fn workspace_select_or_new(&self, name: &str) -> Result<()> {
        let existing = self.workspace_list()?;
        if existing.iter().any(|ws| ws == name) {
            info!(workspace = name, "selecting existing terraform workspace");
            self.run(["workspace", "select", name])?;
        } else {
            info!(workspace = name, "creating terraform workspace");
            self.run(["workspace", "new", name])?;
        }
        Ok(())
    }

    pub fn workspace_delete(&self, name: &str) -> Result<()> {
        if name == DEFAULT_WORKSPACE {
            bail!("refusing to delete the {DEFAULT_WORKSPACE} terraform workspace");
        }
        if self.current_workspace()? == name {
            self.run(["workspace", "select", DEFAULT_WORKSPACE])?;
        }
        info!(workspace = name, "deleting terraform workspace");
        self.run(["workspace", "delete", name])?;
        Ok(())
    }

    pub fn apply(&self) -> Result<()> {
        self.apply_targets(&[])
    }

    pub fn apply_targets(&self, targets: &[String]) -> Result<()> {
        let mut args = vec![
            "apply".to_string(),
            "-input=false".to_string(),
            "-auto-approve".to_string(),
        ];
        args.extend(self.options.var_args());
        args.extend(targets.iter().map(|t| format!("-target={t}")));
        self.run(args)?;
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        let mut args = vec![
            "destroy".to_string(),
            "-input=false".to_string(),
            "-auto-approve".to_string(),
        ];
        args.extend(self.options.var_args());
        self.run(args)?;
        Ok(())
    }

    pub fn output(&self, name: &str) -> Result<String> {
        let out = self.run(["output", "-raw", name])?;
        let value = out.stdout.trim().to_string();
        if value.is_empty() {
            bail!(
                "terraform output {name} is empty in {}",
                self.options.dir.display()
            );
        }
        Ok(value)
    }

    fn run<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("terraform")
            .args(args)
            .current_dir(&self.options.dir);

        let mut attempt = 0;
        loop {
            match self.runner.run(&spec) {
                Ok(out) => return Ok(out),
                Err(err) => {
                    let reason = self.options.retry_reason(&err);
                    match reason {
                        Some(why) if attempt < self.options.max_retries => {
                            attempt += 1;
                            warn!(
                                command = %spec,
                                attempt,
                                max = self.options.max_retries,
                                reason = why,
                                "retryable terraform error"
                            );
                            thread::sleep(self.options.sleep_between_retries);
                        }
                        _ => {
                            return Err(err).with_context(|| {
                                format!("terraform failed in {}", self.options.dir.display())
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Parse `terraform workspace list` output into `(name, is_current)` pairs.
pub fn parse_workspace_list(stdout: &str) -> Vec<(String, bool)> {
    stdout
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.strip_prefix('*') {
                Some(rest) => Some((rest.trim().to_string(), true)),
                None => Some((trimmed.to_string(), false)),
            }
        })
        .collect()
}
