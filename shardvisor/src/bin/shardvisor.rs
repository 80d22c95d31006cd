//! Fleet master: launches the shards, serves their RPCs and reads operator
//! commands from stdin.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use shardvisor::console::stdin_lines;
use shardvisor::logging::init_tracing;
use shardvisor::{
    CommandSpawner, ConsoleCommand, Supervisor, SupervisorConfig, SupervisorHandle,
};

#[derive(Parser, Debug)]
#[command(name = "shardvisor")]
#[command(about = "Master process for a sharded fleet")]
struct Args {
    /// Number of shards in the fleet
    shards: usize,

    /// Address to listen on for shard connections [env: SHARDVISOR_HOST]
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on for shard connections [env: SHARDVISOR_PORT]
    #[arg(short, long)]
    port: Option<u16>,

    /// Shard binary to launch (defaults to shardvisor-shard next to this executable)
    #[arg(long)]
    shard_binary: Option<PathBuf>,

    /// Launch every shard immediately instead of waiting for `start`
    #[arg(long)]
    start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = SupervisorConfig::from_env(args.shards)?;
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(program) = args.shard_binary {
        config = config.with_spawner(Arc::new(CommandSpawner::new(program)));
    }
    if config.secret.is_empty() {
        warn!("SHARDVISOR_SECRET is not set, shards authenticate with an empty secret");
    }

    let (supervisor, handle) = Supervisor::bind(config)
        .await
        .context("failed to start supervisor")?;
    info!(addr = %supervisor.local_addr(), shards = args.shards, "Supervisor listening");

    let mut run = tokio::spawn(supervisor.run());
    if args.start {
        handle.launch_all()?;
    }

    tokio::spawn(console(handle.clone()));

    tokio::select! {
        result = &mut run => return Ok(result??),
        signal = shutdown_signal() => {
            signal.context("failed to install signal handlers")?;
            info!("Shutdown signal received");
        }
    }

    handle.shutdown()?;
    run.await??;
    info!("All shards stopped");
    Ok(())
}

/// Read operator commands from stdin until EOF.
async fn console(handle: SupervisorHandle) {
    let mut lines = stdin_lines();
    while let Some(line) = lines.recv().await {
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Ignoring console input");
                continue;
            }
        };

        info!(%command, "Console command");
        match handle.execute(command).await {
            Ok(Some(snapshot)) => match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => info!("Fleet snapshot:\n{json}"),
                Err(e) => error!(error = %e, "Failed to render snapshot"),
            },
            Ok(None) => {}
            Err(e) => warn!(%command, error = %e, "Console command failed"),
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
