//! Coordinator front end: deploys the handlers, serves the RPC endpoint,
//! runs the workload to completion, and prints the decoded result.

use std::collections::HashMap;
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use belay::substrate_local::{create_local_handlers, HandlerLog, LocalPlatformConfig};
use belay::{result, rpc, Config, ObjectStore, Workload};

#[derive(Parser, Debug)]
#[command(
    name = "belay-coordinator",
    about = "Drive a checkpointed workload on a serverless substrate"
)]
struct Args {
    /// Substrate platform to run handlers on.
    #[arg(long, default_value = "local")]
    platform: String,

    /// Workload name; names the main process and the log directory.
    #[arg(long, default_value = "workload")]
    name: String,

    /// Application event passed to the main process, as JSON.
    #[arg(long, default_value = "{}")]
    event: String,

    /// Environment file with BELAY_* settings (dotenv format).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-invocation handler timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// TCP port for the RPC server (0 picks an unused port).
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Seconds a handler may wait on an RPC before being told to checkpoint.
    #[arg(long)]
    rpc_timeout: Option<u64>,

    /// Environment variable passed through to handlers, KEY=value. Repeatable.
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Directory for coordinator and handler logs (auto-selected if omitted).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Keep logs off disk; the coordinator still logs to stderr.
    #[arg(long)]
    no_logging: bool,

    /// Handler files to deploy to the substrate. Prefix with "<platform>:"
    /// to deploy a file on one platform only.
    #[arg(required = true)]
    deployed_files: Vec<String>,
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) => Ok((key.trim().to_string(), val.trim().to_string())),
        None => Err(format!("misformatted environment variable: {value}")),
    }
}

/// Open `coordinator.log` and `handlers.log` inside the log directory,
/// creating it first. Without an explicit directory, the first free
/// `<name>-log-<i>` in the working directory is used.
fn open_log_files(dir: Option<PathBuf>, workload_name: &str) -> Result<(File, File, PathBuf)> {
    let dir = match dir {
        Some(dir) => {
            match std::fs::create_dir(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("create {}", dir.display()))
                }
            }
            dir
        }
        None => {
            let mut picked = None;
            for i in 0.. {
                let candidate = PathBuf::from(format!("{workload_name}-log-{i}"));
                match std::fs::create_dir(&candidate) {
                    Ok(()) => {
                        picked = Some(candidate);
                        break;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("create {}", candidate.display()))
                    }
                }
            }
            picked.expect("log directory search ended without a candidate")
        }
    };

    let coord_log = File::create(dir.join("coordinator.log"))
        .with_context(|| format!("create coordinator.log in {}", dir.display()))?;
    let handler_log = File::create(dir.join("handlers.log"))
        .with_context(|| format!("create handlers.log in {}", dir.display()))?;
    Ok((coord_log, handler_log, dir))
}

fn init_logging(args: &Args) -> Result<HandlerLog> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "belay=info,belay_coordinator=info".into());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if args.no_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        if args.log_dir.is_some() {
            warn!("--log-dir ignored since --no-logging is set");
        }
        return Ok(HandlerLog::discard());
    }

    let (coord_log, handler_log, dir) = open_log_files(args.log_dir.clone(), &args.name)?;
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(coord_log));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    info!(dir = %dir.display(), "logging to directory");
    Ok(HandlerLog::file(handler_log))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let handler_log = init_logging(&args)?;

    if let Some(path) = &args.config {
        dotenvy::from_path(path)
            .with_context(|| format!("load config file {}", path.display()))?;
    }
    let config = Config::from_env()?;
    let handler_timeout_secs = args.timeout.unwrap_or(config.handler_timeout_secs);
    let rpc_port = args.rpc_port.unwrap_or(config.rpc_port);
    let rpc_timeout = Duration::from_secs(args.rpc_timeout.unwrap_or(config.rpc_timeout_secs));

    info!(platform = %args.platform, "using platform");
    if args.platform != "local" {
        bail!("unsupported platform: {}", args.platform);
    }

    let app_event: serde_json::Value =
        serde_json::from_str(&args.event).context("parse --event JSON")?;

    let user_env: HashMap<String, String> = args.env.iter().cloned().collect();

    // Handlers only run on this machine, so the listener stays on loopback.
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], rpc_port)))
        .await
        .context("bind RPC listener")?;
    let rpc_addr = listener.local_addr()?;

    let runtime_dir = config
        .runtime_dir
        .clone()
        .ok_or_else(|| anyhow!("BELAY_RUNTIME_DIR must point at the handler runtime"))?;

    let handlers = create_local_handlers(LocalPlatformConfig {
        runtime_dir,
        checkpoint_dir: config.checkpoint_dir.clone(),
        workload_name: args.name.clone(),
        deployed_files: args.deployed_files.clone(),
        timeout_secs: handler_timeout_secs,
        env: belay::handler_environment(Some(rpc_addr), rpc_timeout, &user_env),
        handler_log,
    })
    .await?;

    let workload = Workload::new(handlers, ObjectStore::new(&config.store_dir), rpc_timeout);

    {
        let workload = Arc::clone(&workload);
        tokio::spawn(async move {
            if let Err(err) = rpc::serve(listener, workload).await {
                error!(error = %err, "RPC server failed");
            }
        });
    }
    rpc::wait_until_ready(rpc_addr).await?;

    let started = Instant::now();
    let outcome = workload.run(app_event).await;
    info!(duration_secs = started.elapsed().as_secs_f64(), "workload finished");

    workload.finalize().await;

    let ret = outcome?;
    let rendered = result::human_readable(&ret).await?;
    info!(result = %rendered, "final result");
    println!("{rendered}");
    Ok(())
}
