//! shardvisor: master/shard coordination for a horizontally sharded service.
//!
//! The master ([`Supervisor`]) launches one process per shard, authenticates the
//! connection each shard opens back to it, and from then on arbitrates shared quota,
//! fans stats requests out to the fleet and relaunches shards that exit.
//!
//! Each shard runs a [`ShardAgent`], which heartbeats the master and falls back to
//! orphaned mode when the master goes quiet.
//!
//! Both sides speak the framed JSON RPC in [`bridge`].

pub mod agent;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod console;
pub mod gateway;
pub mod limiter;
pub mod logging;
pub mod process;
pub mod stats;
pub mod supervisor;

pub use agent::{AgentError, AgentExit, AgentHandle, AgentState, ShardAgent};
pub use config::{AgentConfig, ConfigError, SupervisorConfig};
pub use console::{ConsoleCommand, ConsoleError, ShardCommand};
pub use gateway::{Gateway, ProcessGateway};
pub use limiter::{QuotaSpec, Quotas, Resource, TokenBucket};
pub use process::{CommandSpawner, ShardSpawnConfig, ShardSpawner, SpawnError};
pub use stats::{StatKind, Stats, StatsReducer};
pub use supervisor::{
    FleetSnapshot, ShardSnapshot, ShardState, Supervisor, SupervisorError, SupervisorHandle,
};
