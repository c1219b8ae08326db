use anyhow::{Context, Result};
use tracing::info;

use super::{
    TestRun,
    exec::{CommandRunner, CommandSpec},
    log_group::LogGroup,
};

/// Block until the ECS service behind this run reports a steady state.
/// The cluster and the service share the run's service name.
pub fn wait_for_service_stable(run: &TestRun, runner: &dyn CommandRunner) -> Result<()> {
    let _group = LogGroup::start("Wait for service to be stable");
    let spec = services_stable(run);
    info!(service = %run.names().service, "waiting for ECS service to stabilise");
    runner
        .run(&spec)
        .with_context(|| format!("service {} never became stable", run.names().service))?;
    run.journal(&format!("service {} stable", run.names().service))?;
    Ok(())
}

pub fn services_stable(run: &TestRun) -> CommandSpec {
    let service = run.names().service.as_str();
    let mut spec = CommandSpec::new("aws").args([
        "ecs",
        "wait",
        "services-stable",
        "--cluster",
        service,
        "--services",
        service,
    ]);
    if let Some(region) = &run.config().aws_region {
        spec = spec.arg("--region").arg(region);
    }
    spec.current_dir(&run.config().repo_root)
}
