use anyhow::{Context, Result, bail};

use super::{
    TestRun,
    exec::{CommandRunner, CommandSpec, run_output},
    log_group::LogGroup,
    terraform::{Terraform, TerraformOptions},
};

/// Initialise the build repository, then build and publish a release image.
pub fn build_and_publish(run: &TestRun, runner: &dyn CommandRunner) -> Result<()> {
    let config = run.config();
    {
        let _group = LogGroup::start("Initialize build-repository module");
        let options = TerraformOptions::new(config.build_repository_dir())
            .backend_config(config.shared_backend_config.clone())
            .with_retries(
                config.terraform.max_retries,
                std::time::Duration::from_millis(config.terraform.sleep_ms),
            );
        Terraform::new(runner, options)
            .init()
            .context("failed to initialise build-repository module")?;
    }

    let app = format!("APP_NAME={}", config.app_name);
    {
        let _group = LogGroup::start("Build release");
        runner
            .run(&make(run, &config.make.build_target, &app))
            .context("release build failed")?;
    }
    {
        let _group = LogGroup::start("Publish release");
        runner
            .run(&make(run, &config.make.publish_target, &app))
            .context("release publish failed")?;
    }
    run.journal("release built and published")?;
    Ok(())
}

/// The image tag a release is published under: the checked-out commit.
pub fn image_tag(run: &TestRun, runner: &dyn CommandRunner) -> Result<String> {
    let spec = CommandSpec::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(&run.config().repo_root);
    let tag = run_output(runner, &spec).context("failed to resolve image tag")?;
    if tag.is_empty() {
        bail!("git rev-parse HEAD returned an empty commit");
    }
    Ok(tag)
}

fn make(run: &TestRun, target: &str, app: &str) -> CommandSpec {
    CommandSpec::new("make")
        .arg(target)
        .arg(app)
        .current_dir(&run.config().repo_root)
}
