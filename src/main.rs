use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use kodo::config::parse_json_map;
use kodo::{identity, ExecutionRequest, Runner, RunnerConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kodo",
    version,
    about = "Kodo CLI - Manage Docker containers and Kubernetes pods"
)]
struct Cli {
    /// JSON runner configuration file
    #[arg(long, global = true, env = "KODO_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command in a local container
    #[command(visible_alias = "docker")]
    Local(LocalArgs),
    /// Run a command in a Kubernetes pod
    #[command(visible_alias = "kubernetes")]
    Cluster(ClusterArgs),
}

#[derive(Args)]
struct TargetArgs {
    /// Image to use
    #[arg(long)]
    image: String,

    /// Target name, generated from the image when omitted
    #[arg(long)]
    name: Option<String>,

    /// Environment variables as JSON string (e.g. '{"KEY1":"value1"}')
    #[arg(long)]
    env: Option<String>,
}

#[derive(Args)]
struct LocalArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Command to execute
    #[arg(long, default_value = "echo \"Hello from Docker!\"")]
    cmd: String,
}

#[derive(Args)]
struct ClusterArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Command to execute
    #[arg(long, default_value = "echo \"Hello from Kubernetes!\"")]
    cmd: String,

    /// Kubernetes namespace
    #[arg(long, default_value = kodo::config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Path to kubeconfig file
    #[arg(long, visible_alias = "kubeconfig")]
    credential_path: Option<PathBuf>,

    /// Node selector as JSON string (e.g. '{"kubernetes.io/os":"linux"}')
    #[arg(long)]
    node_selector: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kodo=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };
    let mut config = RunnerConfig::load(cli.config.as_deref())?;

    match command {
        Command::Local(args) => {
            let environment = parse_json_map(args.target.env.as_deref(), "--env")?;
            let runner = Runner::connect("local", config)
                .await
                .context("cannot connect to the container engine")?;
            run_once(runner, "Docker container", args.target, &args.cmd, environment, None).await
        }
        Command::Cluster(args) => {
            let environment = parse_json_map(args.target.env.as_deref(), "--env")?;
            let node_selector = parse_json_map(args.node_selector.as_deref(), "--node-selector")?;
            config.namespace = args.namespace;
            if let Some(path) = args.credential_path {
                config.kubeconfig = Some(path);
            }
            let runner = Runner::connect("cluster", config)
                .await
                .context("cannot connect to the cluster")?;
            run_once(
                runner,
                "Kubernetes pod",
                args.target,
                &args.cmd,
                environment,
                node_selector,
            )
            .await
        }
    }
}

async fn run_once(
    mut runner: Runner,
    label: &str,
    target: TargetArgs,
    cmd: &str,
    environment: Option<BTreeMap<String, String>>,
    node_selector: Option<BTreeMap<String, String>>,
) -> Result<()> {
    let name = target
        .name
        .unwrap_or_else(|| identity::target_name(&target.image));
    println!("Starting {} '{}' with image '{}'...", label, name, target.image);

    let mut request = ExecutionRequest::new(&target.image);
    if let Some(environment) = environment {
        println!("Environment variables: {:?}", environment);
        request = request.environment(environment);
    }
    if let Some(selector) = node_selector {
        println!("Node selector: {:?}", selector);
        request = request.node_selector(selector);
    }

    let started = match runner.start(request, Some(&name)).await {
        Ok(started) => started,
        Err(e) => {
            runner.cleanup().await;
            return Err(e).with_context(|| format!("cannot start '{}'", name));
        }
    };

    println!("Executing command: {}", cmd);
    let result = runner.execute_command(&started, cmd).await;
    println!("Output: {}", result.output);
    println!("Exit code: {}", result.exit_code);

    runner.cleanup().await;
    Ok(())
}
