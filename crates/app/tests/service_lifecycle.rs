use std::{fs, path::Path};

use anyhow::Result;
use axum::{Router, http::StatusCode, routing::get};
use camino::Utf8PathBuf;
use infra_test_harness::{
    config::HarnessConfig,
    harness::{RecordingRunner, TestRun},
    lifecycle::{run_service_test, teardown_workspace},
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

const ACCESS_LOGS: &str = "resource \"aws_s3_bucket\" \"access_logs\" {\n  force_destroy = false\n}\n";

struct FakeService {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl FakeService {
    async fn start(feature_flags: StatusCode) -> Result<Self> {
        let router = Router::new()
            .route("/", get(|| async { "healthy" }))
            .route("/feature-flags", get(move || async move { feature_flags }));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}", listener.local_addr()?);
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await;
        });
        Ok(Self {
            url,
            shutdown: Some(tx),
            handle,
        })
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

fn prepare_run(root: &Path) -> Result<TestRun> {
    let repo_root = Utf8PathBuf::from_path_buf(root.to_path_buf())
        .map_err(|p| anyhow::anyhow!("non-utf8 temp dir {}", p.display()))?;
    fs::create_dir_all(repo_root.join("infra/modules/service"))?;
    fs::write(repo_root.join("infra/modules/service/access_logs.tf"), ACCESS_LOGS)?;

    let mut config = HarnessConfig {
        repo_root,
        ..HarnessConfig::default()
    };
    config.probe.retries = 2;
    config.probe.sleep_ms = 0;
    config.terraform.sleep_ms = 0;
    TestRun::with_counter(config, 62)
}

fn scripted_runner(endpoint: &str) -> RecordingRunner {
    let runner = RecordingRunner::new();
    runner
        .respond("git rev-parse HEAD", "deadbeef\n")
        .respond("terraform workspace list", "* default\n")
        .respond("terraform workspace show", "t-000010\n")
        .respond("terraform output -raw service_endpoint", endpoint);
    runner
}

#[tokio::test]
async fn service_test_runs_every_step_then_tears_down() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let run = prepare_run(temp.path())?;
    let service = FakeService::start(StatusCode::OK).await?;
    let runner = scripted_runner(&service.url);

    let report = run_service_test(&run, &runner).await?;
    service.stop().await;

    assert_eq!(report.names.workspace, "t-000010");
    assert_eq!(report.image_tag, "deadbeef");
    assert_eq!(report.probes.len(), 2);
    assert!(report.probes.iter().all(|p| p.status == 200 && p.attempts == 1));
    assert_eq!(report.probes[0].body, "healthy");
    assert!(report.probes[1].url.ends_with("/feature-flags"));

    insta::assert_snapshot!(runner.calls().join("\n"), @r"
    terraform init -input=false -backend-config=shared.s3.tfbackend
    make release-build APP_NAME=app
    make release-publish APP_NAME=app
    git rev-parse HEAD
    terraform init -input=false -reconfigure -backend-config=dev.s3.tfbackend
    terraform workspace list
    terraform workspace new t-000010
    terraform apply -input=false -auto-approve -var environment_name=dev -var image_tag=deadbeef
    aws ecs wait services-stable --cluster t-000010-app-dev --services t-000010-app-dev
    terraform output -raw service_endpoint
    terraform apply -input=false -auto-approve -var environment_name=dev -var image_tag=deadbeef -target=module.service.aws_s3_bucket.access_logs
    terraform destroy -input=false -auto-approve -var environment_name=dev -var image_tag=deadbeef
    terraform workspace show
    terraform workspace select default
    terraform workspace delete t-000010
    ");

    let report_path = run.artifacts_dir().join("report.json");
    let saved: serde_json::Value = serde_json::from_slice(&fs::read(report_path)?)?;
    assert_eq!(saved["endpoint"], report.endpoint.as_str());
    assert_eq!(
        fs::read_to_string(temp.path().join("infra/modules/service/access_logs.tf"))?,
        ACCESS_LOGS
    );
    Ok(())
}

#[tokio::test]
async fn failed_apply_still_destroys_and_deletes_the_workspace() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let run = prepare_run(temp.path())?;
    let runner = scripted_runner("http://127.0.0.1:9");
    runner.fail_times(
        "terraform apply -input=false -auto-approve -var environment_name=dev -var image_tag=deadbeef",
        1,
        "Error: creating ECS Service: InvalidParameterException",
    );

    let err = run_service_test(&run, &runner).await.unwrap_err();
    assert!(format!("{err:#}").contains("InvalidParameterException"));

    let calls = runner.calls();
    let tail: Vec<_> = calls.iter().rev().take(5).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            "terraform apply -input=false -auto-approve -var environment_name=dev -var image_tag=deadbeef -target=module.service.aws_s3_bucket.access_logs",
            "terraform destroy -input=false -auto-approve -var environment_name=dev -var image_tag=deadbeef",
            "terraform workspace show",
            "terraform workspace select default",
            "terraform workspace delete t-000010",
        ]
    );
    assert!(!calls.iter().any(|c| c.starts_with("aws ecs wait")));

    let journal = fs::read_to_string(run.logs_dir().join("harness.log"))?;
    assert!(journal.contains("service test failed"));
    Ok(())
}

#[tokio::test]
async fn failing_probe_fails_the_run_after_cleanup() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let run = prepare_run(temp.path())?;
    let service = FakeService::start(StatusCode::SERVICE_UNAVAILABLE).await?;
    let runner = scripted_runner(&service.url);

    let err = run_service_test(&run, &runner).await.unwrap_err();
    service.stop().await;

    let message = format!("{err:#}");
    assert!(message.contains("/feature-flags"), "unexpected error: {message}");
    assert!(message.contains("after 2 attempt(s)"), "unexpected error: {message}");
    assert_eq!(
        runner.calls().last().map(String::as_str),
        Some("terraform workspace delete t-000010")
    );
    assert!(!run.artifacts_dir().join("report.json").exists());
    Ok(())
}

#[tokio::test]
async fn cleanup_failure_is_reported_even_when_checks_pass() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let run = prepare_run(temp.path())?;
    let service = FakeService::start(StatusCode::OK).await?;
    let runner = scripted_runner(&service.url);
    runner.fail("terraform destroy", 1, "Error: BucketNotEmpty");

    let err = run_service_test(&run, &runner).await.unwrap_err();
    service.stop().await;

    let message = format!("{err:#}");
    assert!(message.contains("cleanup failed"), "unexpected error: {message}");
    assert!(message.contains("BucketNotEmpty"), "unexpected error: {message}");
    // The workspace delete still ran after the failed destroy.
    assert_eq!(
        runner.calls().last().map(String::as_str),
        Some("terraform workspace delete t-000010")
    );
    Ok(())
}

#[test]
fn teardown_selects_existing_workspace_only() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let run = prepare_run(temp.path())?;

    let runner = RecordingRunner::new();
    runner
        .respond("git rev-parse HEAD", "deadbeef\n")
        .respond("terraform workspace list", "  default\n* t-000010\n")
        .respond("terraform workspace show", "t-000010\n");
    teardown_workspace(&run, &runner)?;
    let calls = runner.calls();
    assert!(calls.contains(&"terraform workspace select t-000010".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("terraform workspace delete t-000010"));

    let runner = RecordingRunner::new();
    runner
        .respond("git rev-parse HEAD", "deadbeef\n")
        .respond("terraform workspace list", "* default\n");
    assert!(teardown_workspace(&run, &runner).is_err());
    assert!(!runner.calls().iter().any(|c| c.starts_with("terraform destroy")));
    Ok(())
}
