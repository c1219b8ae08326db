use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::now_millis;

/// One invocation of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Shell-like rendering used in logs and error messages.
    pub fn render(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                out.push('"');
                out.push_str(&arg.replace('"', "\\\""));
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed (code {code:?}): {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Combined output of a failed command, used to classify retryable failures.
    pub fn output_text(&self) -> String {
        match self {
            CommandError::Spawn { source, .. } => source.to_string(),
            CommandError::Failed { stdout, stderr, .. } => format!("{stdout}\n{stderr}"),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Runs the command and returns its trimmed stdout.
pub fn run_output(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<String, CommandError> {
    runner.run(spec).map(|out| out.stdout.trim().to_string())
}

/// Whether `name` resolves on `PATH`.
pub fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Executes real processes, echoing their output and keeping a transcript.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    transcript: Option<PathBuf>,
    echo: bool,
}

impl SystemRunner {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            transcript: Some(logs_dir.join("commands.log")),
            echo: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    fn append_transcript(&self, rendered: &str, output: &CommandOutput) {
        let Some(path) = &self.transcript else {
            return;
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "[{}] $ {rendered}", now_millis())?;
            writeln!(file, "exit: {:?}", output.code)?;
            if !output.stdout.is_empty() {
                writeln!(file, "stdout:\n{}", output.stdout.trim_end())?;
            }
            if !output.stderr.is_empty() {
                writeln!(file, "stderr:\n{}", output.stderr.trim_end())?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            warn!(?err, path = %path.display(), "failed to append command transcript");
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let rendered = spec.render();
        info!(command = %rendered, dir = ?spec.current_dir, "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().map_err(|source| CommandError::Spawn {
            command: rendered.clone(),
            source,
        })?;
        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.append_transcript(&rendered, &result);
        if self.echo {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
        }

        if output.status.success() {
            debug!(command = %rendered, "command succeeded");
            return Ok(result);
        }
        Err(CommandError::Failed {
            command: rendered,
            code: result.code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}

#[derive(Debug, Clone)]
struct Scripted {
    prefix: String,
    remaining: Option<usize>,
    outcome: Result<String, (i32, String)>,
}

/// In-memory runner that records invocations and answers from a script.
///
/// Rules match on the rendered command prefix, first match wins. A rule with a
/// use count stops matching once exhausted. Unmatched commands succeed with
/// empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    script: Mutex<Vec<Scripted>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, stdout: &str) -> &Self {
        self.push(prefix, None, Ok(stdout.to_string()))
    }

    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) -> &Self {
        self.push(prefix, None, Err((code, stderr.to_string())))
    }

    pub fn fail_times(&self, prefix: &str, times: usize, stderr: &str) -> &Self {
        self.push(prefix, Some(times), Err((1, stderr.to_string())))
    }

    fn push(
        &self,
        prefix: &str,
        remaining: Option<usize>,
        outcome: Result<String, (i32, String)>,
    ) -> &Self {
        self.script.lock().push(Scripted {
            prefix: prefix.to_string(),
            remaining,
            outcome,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(CommandSpec::render).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let rendered = spec.render();
        self.calls.lock().push(spec.clone());

        let mut script = self.script.lock();
        let rule = script
            .iter_mut()
            .find(|rule| rendered.starts_with(&rule.prefix) && rule.remaining != Some(0));
        let Some(rule) = rule else {
            return Ok(CommandOutput::success(""));
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        match &rule.outcome {
            Ok(stdout) => Ok(CommandOutput::success(stdout.clone())),
            Err((code, stderr)) => Err(CommandError::Failed {
                command: rendered,
                code: Some(*code),
                stdout: String::new(),
                stderr: stderr.clone(),
            }),
        }
    }
}
