//! The service test: build and publish a release, provision the service layer
//! in a fresh workspace, wait for it, probe it, and tear it all down again.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::harness::{
    Cleanup, CommandRunner, LogGroup, ProbeOutcome, ProbeSpec, RunNames, Terraform,
    TerraformOptions, TestRun, aws,
    log_group::grouped,
    probe::{http_get_with_retry, join_endpoint},
    release, teardown,
};

pub const ENDPOINT_OUTPUT: &str = "service_endpoint";

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub names: RunNames,
    pub image_tag: String,
    pub endpoint: String,
    pub probes: Vec<ProbeOutcome>,
}

/// Terraform options for the service module of this run.
pub fn service_options(run: &TestRun, image_tag: &str) -> TerraformOptions {
    let config = run.config();
    TerraformOptions::new(config.service_dir())
        .reconfigure(true)
        .backend_config(config.service_backend_config())
        .var("environment_name", config.environment.clone())
        .var("image_tag", image_tag)
        .with_retries(
            config.terraform.max_retries,
            Duration::from_millis(config.terraform.sleep_ms),
        )
}

pub async fn run_service_test(run: &TestRun, runner: &dyn CommandRunner) -> Result<ServiceReport> {
    release::build_and_publish(run, runner)?;
    let image_tag = release::image_tag(run, runner)?;
    info!(%image_tag, workspace = %run.names().workspace, "provisioning service layer");

    let terraform = Terraform::new(runner, service_options(run, &image_tag));
    grouped("Initialize service module", || terraform.init())
        .context("failed to initialise service module")?;

    let mut cleanup = Cleanup::new();
    let outcome = provision_and_check(run, runner, &terraform, &image_tag, &mut cleanup).await;
    let cleaned = cleanup.run();

    match (outcome, cleaned) {
        (Ok(report), Ok(())) => {
            let path = run.write_artifact("report.json", &report)?;
            run.journal(&format!("service test passed; report at {}", path.display()))?;
            Ok(report)
        }
        (Ok(_), Err(cleanup_err)) => {
            run.journal(&format!("cleanup failed: {cleanup_err}"))?;
            Err(anyhow::Error::new(cleanup_err).context("service checks passed but cleanup failed"))
        }
        (Err(err), cleaned) => {
            if let Err(cleanup_err) = cleaned {
                error!(%cleanup_err, "cleanup failed after a failed service test");
            }
            let _ = run.journal(&format!("service test failed: {err:#}"));
            Err(err)
        }
    }
}

async fn provision_and_check<'a>(
    run: &'a TestRun,
    runner: &dyn CommandRunner,
    terraform: &'a Terraform<'a>,
    image_tag: &str,
    cleanup: &mut Cleanup<'a>,
) -> Result<ServiceReport> {
    let workspace = run.names().workspace.as_str();

    cleanup.defer(format!("delete workspace {workspace}"), move || {
        terraform.workspace_delete(workspace)
    });
    grouped("Select new terraform workspace", || {
        terraform.workspace_select_or_new(workspace)
    })?;

    cleanup.defer("destroy service layer", move || {
        teardown::destroy_service(run, terraform)
    });
    grouped("Create service layer", || terraform.apply())
        .context("failed to create service layer")?;

    aws::wait_for_service_stable(run, runner)?;

    let (endpoint, probes) = check_service(run, terraform).await?;
    Ok(ServiceReport {
        names: run.names().clone(),
        image_tag: image_tag.to_string(),
        endpoint,
        probes,
    })
}

/// Probe every configured path of the service endpoint.
async fn check_service(
    run: &TestRun,
    terraform: &Terraform<'_>,
) -> Result<(String, Vec<ProbeOutcome>)> {
    let probe = &run.config().probe;
    let _group = LogGroup::start(format!(
        "Check service for healthy status {}",
        probe.expect_status
    ));
    let endpoint = terraform.output(ENDPOINT_OUTPUT)?;
    let expected = probe.expect_status;

    let mut outcomes = Vec::with_capacity(probe.paths.len());
    for path in &probe.paths {
        let spec = ProbeSpec::new(join_endpoint(&endpoint, path))
            .retries(probe.retries)
            .sleep(Duration::from_millis(probe.sleep_ms))
            .validate(move |status, _body| status == expected);
        outcomes.push(http_get_with_retry(&spec).await?);
    }
    run.journal(&format!("{} probe(s) passed against {endpoint}", outcomes.len()))?;
    Ok((endpoint, outcomes))
}

/// Destroy the service layer of an existing workspace and delete the workspace.
pub fn teardown_workspace(run: &TestRun, runner: &dyn CommandRunner) -> Result<()> {
    let image_tag = release::image_tag(run, runner)?;
    let terraform = Terraform::new(runner, service_options(run, &image_tag));
    let workspace = run.names().workspace.as_str();

    grouped("Initialize service module", || terraform.init())?;
    grouped("Select terraform workspace", || {
        terraform.workspace_select(workspace)
    })?;
    teardown::destroy_service(run, &terraform)?;
    grouped("Delete terraform workspace", || {
        terraform.workspace_delete(workspace)
    })?;
    run.journal(&format!("workspace {workspace} torn down"))?;
    Ok(())
}
