use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tracing::info;

use infra_test_harness::{
    config::HarnessConfig,
    harness::{
        RunNames, SystemRunner, TestRun,
        exec::tool_available,
        probe::{ProbeSpec, http_get_with_retry},
    },
    lifecycle, unique_id,
};

const REQUIRED_TOOLS: &[&str] = &["terraform", "aws", "make", "git"];

#[derive(Parser, Debug)]
#[command(
    name = "infra-test",
    version,
    about = "Provision, probe and tear down an application stack in a throwaway workspace"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a short unique id, or decode one
    UniqueId(UniqueIdArgs),
    /// Print the workspace and service names a run would use
    Names(NamesArgs),
    /// Run the full service test: build, provision, probe, destroy
    Service(ConfigArgs),
    /// Destroy a workspace left behind by an interrupted run
    Teardown(TeardownArgs),
    /// Probe an HTTP endpoint with retries
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to the configuration file (defaults to infra-test.toml at the repo root)
    #[arg(long, value_name = "PATH")]
    config: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
struct UniqueIdArgs {
    /// Counter to encode instead of the current UTC second
    #[arg(long, allow_negative_numbers = true, conflicts_with = "decode")]
    counter: Option<i64>,
    /// Decode an id back into its counter
    #[arg(long, value_name = "ID")]
    decode: Option<String>,
    /// Keep the mixed-case form instead of lowercasing
    #[arg(long, default_value_t = false)]
    raw: bool,
}

#[derive(Args, Debug)]
struct NamesArgs {
    #[arg(long)]
    counter: Option<u64>,
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args, Debug)]
struct TeardownArgs {
    /// Workspace to destroy, e.g. t-1r31eq
    #[arg(long)]
    workspace: String,
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    #[arg(long)]
    url: String,
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    retries: u32,
    #[arg(long, default_value_t = 1_000)]
    sleep_ms: u64,
    #[arg(long, default_value_t = 200)]
    expect: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::UniqueId(args) => unique_id_cli(args)?,
        Command::Names(args) => names_cli(args)?,
        Command::Service(args) => service_cli(args).await?,
        Command::Teardown(args) => teardown_cli(args)?,
        Command::Probe(args) => probe_cli(args).await?,
    }

    Ok(())
}

fn unique_id_cli(args: UniqueIdArgs) -> Result<()> {
    if let Some(id) = args.decode {
        let counter = unique_id::decode(&id).with_context(|| format!("cannot decode {id:?}"))?;
        println!("{counter}");
        return Ok(());
    }

    let id = match args.counter {
        Some(counter) => unique_id::encode_signed(counter)?,
        None => unique_id::encode_signed(chrono::Utc::now().timestamp())?,
    };
    if args.raw {
        println!("{id}");
    } else {
        println!("{}", id.to_ascii_lowercase());
    }
    Ok(())
}

fn names_cli(args: NamesArgs) -> Result<()> {
    let config = HarnessConfig::load(args.config.config.as_deref())?;
    let id = match args.counter {
        Some(counter) => unique_id::encode(counter).to_ascii_lowercase(),
        None => unique_id::from_clock()?,
    };
    let names = RunNames::new(&config, id);
    println!("unique_id={}", names.unique_id);
    println!("workspace={}", names.workspace);
    println!("service={}", names.service);
    Ok(())
}

async fn service_cli(args: ConfigArgs) -> Result<()> {
    ensure_tools()?;
    let config = HarnessConfig::load(args.config.as_deref())?;
    let run = TestRun::start(config)?;
    let runner = SystemRunner::new(run.logs_dir());
    // Terraform, make and aws block this task, so Ctrl-C only takes effect at the
    // next await (the HTTP checks) or once the run returns. Dropping the future
    // there still runs the deferred teardown. The signal branch is polled first
    // so the handler is installed before any blocking step starts.
    let report = tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => bail!("interrupted before the service test finished"),
        report = lifecycle::run_service_test(&run, &runner) => report?,
    };
    info!(
        workspace = %report.names.workspace,
        endpoint = %report.endpoint,
        probes = report.probes.len(),
        "service test passed"
    );
    Ok(())
}

fn teardown_cli(args: TeardownArgs) -> Result<()> {
    ensure_tools()?;
    let config = HarnessConfig::load(args.config.config.as_deref())?;
    let names = RunNames::for_workspace(&config, &args.workspace)?;
    let run = TestRun::with_names(config, names)?;
    let runner = SystemRunner::new(run.logs_dir());
    lifecycle::teardown_workspace(&run, &runner)?;
    info!(workspace = %args.workspace, "workspace torn down");
    Ok(())
}

async fn probe_cli(args: ProbeArgs) -> Result<()> {
    let expected = args.expect;
    let spec = ProbeSpec::new(args.url)
        .retries(args.retries)
        .sleep(Duration::from_millis(args.sleep_ms))
        .validate(move |status, _body| status == expected);
    let outcome = http_get_with_retry(&spec).await?;
    println!(
        "{} -> {} after {} attempt(s)",
        outcome.url, outcome.status, outcome.attempts
    );
    Ok(())
}

fn ensure_tools() -> Result<()> {
    let missing: Vec<_> = REQUIRED_TOOLS
        .iter()
        .filter(|tool| !tool_available(tool))
        .collect();
    if !missing.is_empty() {
        bail!("required tools not found on PATH: {missing:?}");
    }
    Ok(())
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
