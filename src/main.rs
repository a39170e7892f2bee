//! Lattice node lifecycle - Kubernetes worker join/removal for Auto Scaling events

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lambda_runtime::{service_fn, LambdaEvent};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::info;

use lattice_node_lifecycle::config::{resolve_control_plane_host, ControllerArgs};
use lattice_node_lifecycle::controller::{Context, EventDispatcher};
use lattice_node_lifecycle::fleet::{AutoScalingHooks, Ec2Fleet};
use lattice_node_lifecycle::naming::NodeNaming;
use lattice_node_lifecycle::readiness::TcpProbe;
use lattice_node_lifecycle::remote::SshExecutor;
use lattice_node_lifecycle::secrets::SecretsManagerProvider;
use lattice_node_lifecycle::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Join and remove Kubernetes worker nodes as an Auto Scaling group scales
#[derive(Parser, Debug)]
#[command(name = "lattice-node-lifecycle", version, about, long_about = None)]
struct Cli {
    /// Log format (json or text)
    #[arg(long, env = "LATTICE_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an AWS Lambda function
    ///
    /// Each invocation payload is one lifecycle notification; the function
    /// result is the status response.
    Lambda(ControllerArgs),

    /// Handle one notification from a file or stdin and print the response
    ///
    /// Exits 0 when the response status is 200, 1 otherwise.
    Handle(HandleArgs),

    /// Print the node name for a private IPv4 address
    NodeName {
        /// Private IPv4 address of the instance
        address: String,

        /// Node naming convention of the cluster
        #[arg(long, env = "LATTICE_NODE_NAMING", default_value = "ip-dashed")]
        node_naming: NodeNaming,
    },
}

#[derive(Parser, Debug)]
struct HandleArgs {
    /// Notification JSON file; stdin when absent
    #[arg(long)]
    event: Option<PathBuf>,

    #[command(flatten)]
    controller: ControllerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        filter: None,
    })?;

    match cli.command {
        Commands::Lambda(args) => run_lambda(args).await,
        Commands::Handle(args) => run_handle(args).await,
        Commands::NodeName {
            address,
            node_naming,
        } => {
            let node = node_naming.resolve_address(&address)?;
            println!("{node}");
            Ok(())
        }
    }
}

/// Resolve configuration and wire the AWS-backed collaborators
async fn build_dispatcher(args: ControllerArgs) -> anyhow::Result<EventDispatcher> {
    let sdk_config = aws_config::load_from_env().await;
    let fleet = Arc::new(Ec2Fleet::new(&sdk_config));

    let locator = args.control_plane_locator()?;
    let host = resolve_control_plane_host(&locator, fleet.as_ref()).await?;
    let config = Arc::new(args.into_config(host)?);

    info!(
        control_plane = %config.control_plane.host,
        node_naming = %config.node_naming,
        complete_lifecycle_action = config.complete_lifecycle_action,
        "Controller configured"
    );

    let secrets = Arc::new(SecretsManagerProvider::new(
        &sdk_config,
        config.secret_id.clone(),
        config.secret_field.clone(),
    ));
    let executor = Arc::new(SshExecutor::new(
        config.ssh_connect_timeout,
        config.ssh_io_timeout(),
    ));
    let probe = Arc::new(TcpProbe::new(config.ssh_connect_timeout));

    let ctx = Context::new(config, secrets, executor, fleet, probe)
        .with_lifecycle_hooks(Arc::new(AutoScalingHooks::new(&sdk_config)));

    Ok(EventDispatcher::from_context(Arc::new(ctx)))
}

/// Serve Lambda invocations until the runtime shuts down
async fn run_lambda(args: ControllerArgs) -> anyhow::Result<()> {
    let dispatcher = Arc::new(build_dispatcher(args).await?);

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let dispatcher = dispatcher.clone();
        async move {
            info!(request_id = %event.context.request_id, "Invocation received");
            Ok::<_, lambda_runtime::Error>(dispatcher.handle(event.payload).await)
        }
    }))
    .await
    .map_err(|e| anyhow::anyhow!("Lambda runtime failed: {e}"))
}

/// Handle one notification and print the response JSON
async fn run_handle(args: HandleArgs) -> anyhow::Result<()> {
    let payload = match &args.event {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read event file {:?}: {}", path, e))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read event from stdin: {}", e))?;
            buf
        }
    };

    let dispatcher = build_dispatcher(args.controller).await?;
    let response = dispatcher.handle_json(&payload).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
