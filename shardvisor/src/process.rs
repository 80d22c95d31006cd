//! Shard process launching and exit watching.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::bridge::protocol::ShardIndex;
use crate::config::{ENV_HOST, ENV_PORT};

/// How long a terminated shard gets to exit before it is killed outright.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("shard program {} does not exist", .0.display())]
    ProgramNotFound(PathBuf),
}

/// What a spawner needs to know about the shard it starts.
#[derive(Debug, Clone, Copy)]
pub struct ShardSpawnConfig {
    pub shard: ShardIndex,
    pub total_shards: usize,
    /// Where the shard should find the master.
    pub master_addr: SocketAddr,
}

/// Extension point for how shard processes are started.
pub trait ShardSpawner: Send + Sync {
    fn spawn(&self, config: &ShardSpawnConfig) -> Result<Child, SpawnError>;
}

/// Runs `<program> [args..] <shard> <total>` with `SHARDVISOR_HOST` and
/// `SHARDVISOR_PORT` pointing at the master.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// `name` in the directory of the running executable, or bare `name` for a PATH
    /// lookup when that directory is unknown.
    pub fn sibling(name: &str) -> Self {
        let program = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from(name));
        Self::new(program)
    }

    /// Arguments placed before the shard index and count.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra environment for every launched shard.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Bare names are left to the PATH lookup; anything with a directory must exist.
    fn check_program(&self) -> Result<(), SpawnError> {
        let has_dir = self.program.components().count() > 1;
        if has_dir && !self.program.exists() {
            return Err(SpawnError::ProgramNotFound(self.program.clone()));
        }
        Ok(())
    }
}

/// A wildcard bind address is not something a shard can connect to.
fn reachable(addr: SocketAddr) -> SocketAddr {
    if !addr.ip().is_unspecified() {
        return addr;
    }
    let loopback: std::net::IpAddr = if addr.is_ipv4() {
        std::net::Ipv4Addr::LOCALHOST.into()
    } else {
        std::net::Ipv6Addr::LOCALHOST.into()
    };
    SocketAddr::new(loopback, addr.port())
}

impl ShardSpawner for CommandSpawner {
    fn spawn(&self, config: &ShardSpawnConfig) -> Result<Child, SpawnError> {
        self.check_program()?;
        let master = reachable(config.master_addr);
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(config.shard.to_string())
            .arg(config.total_shards.to_string())
            .env(ENV_HOST, master.ip().to_string())
            .env(ENV_PORT, master.port().to_string())
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// How to stop a shard process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM, then kill after [`TERMINATE_GRACE`].
    Graceful,
    Kill,
}

/// How a watched process ended.
#[derive(Debug)]
pub struct ProcessExit {
    pub shard: ShardIndex,
    pub pid: Option<u32>,
    /// `None` if waiting on the process failed.
    pub status: Option<ExitStatus>,
}

/// Supervisor-side handle to a running shard process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop: Option<oneshot::Sender<Termination>>,
}

impl ProcessHandle {
    /// Hand `child` to a watcher task that calls `on_exit` once the process ends.
    pub fn watch<F>(shard: ShardIndex, child: Child, on_exit: F) -> Self
    where
        F: FnOnce(ProcessExit) + Send + 'static,
    {
        let pid = child.id();
        let (stop, stop_rx) = oneshot::channel();
        tokio::spawn(watch_child(shard, child, stop_rx, on_exit));
        Self {
            pid,
            stop: Some(stop),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the watcher to stop the process. Only the first request has any effect.
    pub fn stop(&mut self, how: Termination) -> bool {
        match self.stop.take() {
            Some(tx) => tx.send(how).is_ok(),
            None => false,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_none()
    }
}

async fn watch_child<F>(
    shard: ShardIndex,
    mut child: Child,
    mut stop: oneshot::Receiver<Termination>,
    on_exit: F,
) where
    F: FnOnce(ProcessExit),
{
    let pid = child.id();
    let waited = tokio::select! {
        status = child.wait() => status,
        how = &mut stop => match how {
            Ok(how) => stop_child(shard, &mut child, how).await,
            // Handle dropped without a request; keep watching.
            Err(_) => child.wait().await,
        },
    };

    let status = match waited {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!(shard, error = %e, "Failed to wait on shard process");
            None
        }
    };
    on_exit(ProcessExit { shard, pid, status });
}

async fn stop_child(
    shard: ShardIndex,
    child: &mut Child,
    how: Termination,
) -> std::io::Result<ExitStatus> {
    if how == Termination::Graceful && send_sigterm(child) {
        tracing::debug!(shard, "Sent SIGTERM to shard process");
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                tracing::warn!(shard, grace = ?TERMINATE_GRACE, "Shard ignored SIGTERM, killing");
            }
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(shard, error = %e, "Failed to kill shard process");
    }
    child.wait().await
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
