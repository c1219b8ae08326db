use thiserror::Error;
use tracing::{error, info};

type Action<'a> = Box<dyn FnOnce() -> anyhow::Result<()> + 'a>;

#[derive(Debug, Error)]
#[error("{} cleanup step(s) failed:{}", .failures.len(), describe(.failures))]
pub struct CleanupError {
    pub failures: Vec<(String, anyhow::Error)>,
}

fn describe(failures: &[(String, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(label, err)| format!(" [{label}: {err:#}]"))
        .collect()
}

/// Deferred teardown actions, run last-registered first.
///
/// Every action runs even when an earlier one fails. Dropping a `Cleanup`
/// that was never run executes whatever is still pending.
#[derive(Default)]
pub struct Cleanup<'a> {
    actions: Vec<(String, Action<'a>)>,
}

impl<'a> Cleanup<'a> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    pub fn defer(&mut self, label: impl Into<String>, action: impl FnOnce() -> anyhow::Result<()> + 'a) {
        self.actions.push((label.into(), Box::new(action)));
    }

    pub fn pending(&self) -> Vec<&str> {
        self.actions
            .iter()
            .rev()
            .map(|(label, _)| label.as_str())
            .collect()
    }

    pub fn run(mut self) -> Result<(), CleanupError> {
        let failures = self.drain();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }

    fn drain(&mut self) -> Vec<(String, anyhow::Error)> {
        let mut failures = Vec::new();
        while let Some((label, action)) = self.actions.pop() {
            info!(step = %label, "running cleanup");
            if let Err(err) = action() {
                error!(step = %label, error = %format!("{err:#}"), "cleanup step failed");
                failures.push((label, err));
            }
        }
        failures
    }
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            let _ = self.drain();
        }
    }
}
