use std::fs;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use tracing::{error, info, warn};

use super::{TestRun, log_group::LogGroup, terraform::Terraform};
use crate::path_safety::existing_file_under_root;

/// Deletion guards flipped so Terraform is allowed to remove guarded resources.
pub const GUARD_REWRITES: &[(&str, &str)] = &[
    ("force_destroy = false", "force_destroy = true"),
    ("prevent_destroy = true", "prevent_destroy = false"),
];

/// Terraform sources rewritten in place, each with a `.bak` copy of the original.
#[derive(Debug, Default)]
#[must_use = "patched sources must be restored"]
pub struct PatchedSources {
    files: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

impl PatchedSources {
    pub fn files(&self) -> impl Iterator<Item = &Utf8PathBuf> {
        self.files.iter().map(|(original, _)| original)
    }

    /// Put every original back. Keeps going past failures and reports the first.
    pub fn restore(self) -> Result<()> {
        let mut first_err = None;
        for (original, backup) in self.files {
            if let Err(err) = fs::rename(&backup, &original) {
                warn!(file = %original, ?err, "failed to restore terraform source");
                first_err.get_or_insert_with(|| {
                    anyhow::Error::new(err).context(format!("failed to restore {original}"))
                });
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn rewrite_guards(source: &str) -> String {
    GUARD_REWRITES
        .iter()
        .fold(source.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Rewrite the configured sources so guarded resources can be destroyed.
pub fn lift_destroy_guards(run: &TestRun) -> Result<PatchedSources> {
    let config = run.config();
    let mut patched = PatchedSources::default();
    for file in &config.destroy.patch_files {
        let result = (|| -> Result<(Utf8PathBuf, Utf8PathBuf)> {
            let path = existing_file_under_root(&config.repo_root, file)?;
            let backup = Utf8PathBuf::from(format!("{path}.bak"));
            // A leftover backup holds the original from an interrupted run.
            if backup.exists() {
                warn!(file = %path, "restoring leftover backup before patching");
                fs::rename(&backup, &path)
                    .with_context(|| format!("failed to restore leftover backup {backup}"))?;
            }
            let source =
                fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
            fs::copy(&path, &backup).with_context(|| format!("failed to back up {path}"))?;
            fs::write(&path, rewrite_guards(&source))
                .with_context(|| format!("failed to write {path}"))?;
            Ok((path, backup))
        })();
        match result {
            Ok(entry) => {
                info!(file = %entry.0, "lifted destroy guards");
                patched.files.push(entry);
            }
            Err(err) => return Err(abandon(patched, err)),
        }
    }
    Ok(patched)
}

/// Restore `patched` after `err`, folding any restore failure into the returned error.
fn abandon(patched: PatchedSources, err: anyhow::Error) -> anyhow::Error {
    match patched.restore() {
        Ok(()) => err,
        Err(restore_err) => {
            error!(
                error = %format!("{err:#}"),
                restore_error = %format!("{restore_err:#}"),
                "terraform sources left patched"
            );
            err.context(format!("terraform sources left patched: {restore_err:#}"))
        }
    }
}

/// Lift the guards and apply them to the guarded resources only.
pub fn enable_destroy(run: &TestRun, terraform: &Terraform<'_>) -> Result<PatchedSources> {
    let patched = lift_destroy_guards(run)?;
    let targets = &run.config().destroy.targets;
    if targets.is_empty() {
        return Ok(patched);
    }
    if let Err(err) = terraform.apply_targets(targets) {
        return Err(abandon(
            patched,
            err.context("failed to apply lifted destroy guards"),
        ));
    }
    Ok(patched)
}

/// Destroy everything in the current workspace, then restore the patched sources.
pub fn destroy_service(run: &TestRun, terraform: &Terraform<'_>) -> Result<()> {
    let _group = LogGroup::start("Destroy service layer");
    let patched = enable_destroy(run, terraform)?;
    if let Err(err) = terraform.destroy() {
        return Err(abandon(patched, err.context("terraform destroy failed")));
    }
    patched.restore()?;
    run.journal("service layer destroyed")?;
    Ok(())
}
