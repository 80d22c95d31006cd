//! Shard process launched by the master as `shardvisor-shard <index> <total>`.
//!
//! Reads `die`, `jumpstart` and `tryunorphan` from stdin.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use shardvisor::console::stdin_lines;
use shardvisor::logging::init_tracing;
use shardvisor::{AgentConfig, AgentExit, AgentHandle, ProcessGateway, ShardAgent, ShardCommand};

#[derive(Parser, Debug)]
#[command(name = "shardvisor-shard")]
#[command(about = "One shard of a shardvisor fleet")]
struct Args {
    /// Index of this shard
    index: usize,

    /// Number of shards in the fleet
    total: usize,

    /// Name reported in stats
    #[arg(long, default_value = "shardvisor-shard")]
    name: String,

    /// Connect the gateway at startup instead of waiting for the master
    #[arg(short, long)]
    jumpstart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = AgentConfig::from_env(args.index, args.total)?;
    let gateway = Arc::new(ProcessGateway::new(args.name));
    let (agent, handle) = ShardAgent::new(config, gateway).context("invalid shard configuration")?;

    let signals = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signals.shutdown();
        }
    });
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        let signals = handle.clone();
        tokio::spawn(async move {
            terminate.recv().await;
            signals.shutdown();
        });
    }

    if args.jumpstart {
        let handle = handle.clone();
        tokio::spawn(async move { handle.jumpstart().await });
    }
    tokio::spawn(console(handle.clone()));

    match agent.run().await? {
        AgentExit::Die => info!(shard = args.index, "Exiting at master's request"),
        AgentExit::Shutdown => info!(shard = args.index, "Exiting on request"),
    }
    Ok(())
}

/// Read shard commands from stdin until EOF. EOF leaves the shard running.
async fn console(handle: AgentHandle) {
    let mut lines = stdin_lines();
    while let Some(line) = lines.recv().await {
        let command = match ShardCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Ignoring console input");
                continue;
            }
        };

        info!(%command, "Console command");
        if let Err(e) = handle.execute(command).await {
            warn!(%command, error = %e, "Console command failed");
        }
    }
}
