use infra_test_harness::{
    config::HarnessConfig,
    harness::{SystemRunner, TestRun, exec::tool_available},
    lifecycle::run_service_test,
};

fn e2e_enabled() -> bool {
    std::env::var("INFRA_TEST_E2E")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Provisions real infrastructure. Opt in with INFRA_TEST_E2E=1 and cloud credentials.
#[tokio::test]
async fn e2e_service_round_trip() -> anyhow::Result<()> {
    if !e2e_enabled() {
        eprintln!("skipping e2e_service_round_trip: set INFRA_TEST_E2E=1 to provision a stack");
        return Ok(());
    }
    for tool in ["terraform", "aws", "make", "git"] {
        if !tool_available(tool) {
            eprintln!("skipping e2e_service_round_trip: {tool} not on PATH");
            return Ok(());
        }
    }

    let config = HarnessConfig::load(None)?;
    let run = TestRun::start(config)?;
    let runner = SystemRunner::new(run.logs_dir());

    let report = run_service_test(&run, &runner).await?;
    assert!(report.names.workspace.starts_with("t-"));
    assert!(report.probes.iter().all(|p| p.status == 200));
    assert!(run.artifacts_dir().join("report.json").is_file());
    Ok(())
}
