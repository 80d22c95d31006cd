//! Master and shard configuration.
//!
//! Both sides build a config from defaults, apply environment overrides and then any
//! `with_*` calls the binary makes from its command line.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::protocol::ShardIndex;
use crate::limiter::{QuotaSpec, Resource};
use crate::process::{CommandSpawner, ShardSpawner};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 42343;

/// Binary the stock spawner launches, looked up next to the running executable.
pub const SHARD_BINARY: &str = "shardvisor-shard";

pub const ENV_SECRET: &str = "SHARDVISOR_SECRET";
pub const ENV_HOST: &str = "SHARDVISOR_HOST";
pub const ENV_PORT: &str = "SHARDVISOR_PORT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("fleet must have at least one shard")]
    NoShards,

    #[error("shard index {index} out of range for {total} shards")]
    IndexOutOfRange { index: ShardIndex, total: usize },

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Overrides read from the environment. Empty variables count as unset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct EnvOverrides {
    secret: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

impl EnvOverrides {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());
        let port = match get(ENV_PORT) {
            None => None,
            Some(value) => Some(value.parse::<u16>().map_err(|e| ConfigError::InvalidEnv {
                var: ENV_PORT,
                reason: e.to_string(),
                value,
            })?),
        };
        Ok(Self {
            secret: get(ENV_SECRET),
            host: get(ENV_HOST),
            port,
        })
    }
}

fn require_nonzero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { name });
    }
    Ok(())
}

pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub total_shards: usize,
    pub secret: String,
    pub spawner: Arc<dyn ShardSpawner>,
    /// Delay before relaunching a shard whose process exited.
    pub restart_backoff: Duration,
    /// Sent to every shard in `setup`.
    pub heartbeat_interval: Duration,
    /// `connect` on the whole fleet waits `stagger * index` on each shard.
    pub connect_stagger: Duration,
    /// Wait used when the operator connects a single shard.
    pub single_connect_wait: Duration,
    /// How long a new connection has to send its identification frame.
    pub identify_timeout: Duration,
    /// Largest identification frame accepted, in bytes.
    pub max_identify_frame: usize,
    /// How long attached shards get to obey `die` during shutdown before their
    /// processes are terminated.
    pub shutdown_grace: Duration,
    /// Per-resource overrides; resources not listed use their default quota.
    pub quotas: BTreeMap<Resource, QuotaSpec>,
}

impl fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("total_shards", &self.total_shards)
            .field("secret", &"<redacted>")
            .field("restart_backoff", &self.restart_backoff)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_stagger", &self.connect_stagger)
            .field("identify_timeout", &self.identify_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("quotas", &self.quotas)
            .finish_non_exhaustive()
    }
}

impl SupervisorConfig {
    pub fn new(total_shards: usize) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            total_shards,
            secret: String::new(),
            spawner: Arc::new(CommandSpawner::sibling(SHARD_BINARY)),
            restart_backoff: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(50),
            connect_stagger: Duration::from_secs(5),
            single_connect_wait: Duration::from_secs(3),
            identify_timeout: Duration::from_secs(10),
            max_identify_frame: 64 * 1024,
            shutdown_grace: Duration::from_secs(10),
            quotas: BTreeMap::new(),
        }
    }

    /// Defaults with `SHARDVISOR_SECRET`, `SHARDVISOR_HOST` and `SHARDVISOR_PORT` applied.
    pub fn from_env(total_shards: usize) -> Result<Self, ConfigError> {
        Ok(Self::new(total_shards).with_overrides(EnvOverrides::from_env()?))
    }

    fn with_overrides(mut self, env: EnvOverrides) -> Self {
        if let Some(secret) = env.secret {
            self.secret = secret;
        }
        if let Some(host) = env.host {
            self.host = host;
        }
        if let Some(port) = env.port {
            self.port = port;
        }
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ShardSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_stagger(mut self, stagger: Duration) -> Self {
        self.connect_stagger = stagger;
        self
    }

    pub fn with_identify_timeout(mut self, timeout: Duration) -> Self {
        self.identify_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_quota(mut self, resource: Resource, spec: QuotaSpec) -> Self {
        self.quotas.insert(resource, spec);
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_shards == 0 {
            return Err(ConfigError::NoShards);
        }
        require_nonzero("heartbeat interval", self.heartbeat_interval)?;
        require_nonzero("identify timeout", self.identify_timeout)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AgentConfig {
    pub shard_index: ShardIndex,
    pub total_shards: usize,
    pub master_host: String,
    pub master_port: u16,
    pub secret: String,
    /// Pause between reattachment attempts while orphaned.
    pub retry_delay: Duration,
    /// Unanswered pings tolerated before the shard orphans itself.
    pub max_missed_pings: u32,
    /// Rate limit on entering orphaned mode.
    pub adopt_quota: QuotaSpec,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("shard_index", &self.shard_index)
            .field("total_shards", &self.total_shards)
            .field("master_host", &self.master_host)
            .field("master_port", &self.master_port)
            .field("secret", &"<redacted>")
            .field("retry_delay", &self.retry_delay)
            .field("max_missed_pings", &self.max_missed_pings)
            .field("adopt_quota", &self.adopt_quota)
            .finish()
    }
}

impl AgentConfig {
    pub fn new(shard_index: ShardIndex, total_shards: usize) -> Self {
        Self {
            shard_index,
            total_shards,
            master_host: DEFAULT_HOST.to_string(),
            master_port: DEFAULT_PORT,
            secret: String::new(),
            retry_delay: Duration::from_secs(10),
            max_missed_pings: 2,
            adopt_quota: QuotaSpec::per_minute(15),
        }
    }

    pub fn from_env(shard_index: ShardIndex, total_shards: usize) -> Result<Self, ConfigError> {
        Ok(Self::new(shard_index, total_shards).with_overrides(EnvOverrides::from_env()?))
    }

    fn with_overrides(mut self, env: EnvOverrides) -> Self {
        if let Some(secret) = env.secret {
            self.secret = secret;
        }
        if let Some(host) = env.host {
            self.master_host = host;
        }
        if let Some(port) = env.port {
            self.master_port = port;
        }
        self
    }

    pub fn with_master(mut self, host: impl Into<String>, port: u16) -> Self {
        self.master_host = host.into();
        self.master_port = port;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_missed_pings(mut self, missed: u32) -> Self {
        self.max_missed_pings = missed;
        self
    }

    pub fn with_adopt_quota(mut self, quota: QuotaSpec) -> Self {
        self.adopt_quota = quota;
        self
    }

    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_shards == 0 {
            return Err(ConfigError::NoShards);
        }
        if self.shard_index >= self.total_shards {
            return Err(ConfigError::IndexOutOfRange {
                index: self.shard_index,
                total: self.total_shards,
            });
        }
        require_nonzero("retry delay", self.retry_delay)?;
        Ok(())
    }
}
