//! The upstream connection a shard runs, seen through the narrow interface the agent needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::stats::Stats;

/// Upstream connection owned by a shard.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Connect upstream. Returns whether the connection came up.
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Counters describing this shard. The agent adds `shardNum`, `shards` and `orphan`.
    fn stats(&self) -> Stats;
}

/// Gateway that only reports on the shard process itself.
///
/// Used by the stock shard binary; a real deployment supplies its own [`Gateway`].
#[derive(Debug)]
pub struct ProcessGateway {
    name: String,
    started: Instant,
    connected: AtomicBool,
}

impl ProcessGateway {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Gateway for ProcessGateway {
    async fn connect(&self) -> bool {
        self.connected.store(true, Ordering::Release);
        true
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> Stats {
        let mut stats = Stats::new();
        stats.insert("name".into(), Value::from(self.name.clone()));
        stats.insert(
            "uptime".into(),
            Value::from(self.started.elapsed().as_secs_f64()),
        );
        if let Some(memory) = resident_memory_mb() {
            stats.insert("memory".into(), Value::from(memory));
        }
        stats
    }
}

/// Resident set size in megabytes (10^6 bytes).
#[cfg(target_os = "linux")]
fn resident_memory_mb() -> Option<f64> {
    // statm fields are in pages; the second is the resident set.
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|size| u64::try_from(size).ok())
        .unwrap_or(4096);
    Some((pages * page_size) as f64 / 1_000_000.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> Option<f64> {
    None
}
