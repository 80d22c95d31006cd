//! Supervisor - the master side of the fleet.
//!
//! Flow:
//! 1. Bind the master listener
//! 2. Launch shard processes and watch them for exit
//! 3. Authenticate each incoming connection by its identification frame
//! 4. Attach an RPC channel to the shard and send `setup`
//! 5. Serve shard calls: pings, quota tokens, fleet stats
//! 6. On process exit: relaunch after a backoff, unless shutting down
//!
//! [`Supervisor`] is an actor. Its run loop is the only code that touches the shard
//! arena, the aggregations and the lifecycle flags; channel handlers, watcher tasks
//! and [`SupervisorHandle`] feed it events over one queue.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthError};
use crate::bridge::protocol::{
    Call, CallId, ConnectParams, Identify, MasterCall, SetupParams, ShardCall, ShardIndex,
};
use crate::bridge::{CallHandler, FrameError, RpcChannel, RpcError, decode_frame_capped};
use crate::config::{ConfigError, SupervisorConfig};
use crate::console::{ConsoleCommand, ConsoleError};
use crate::limiter::{Quotas, Resource};
use crate::process::{ProcessExit, ProcessHandle, ShardSpawnConfig, Termination};
use crate::stats::{Aggregation, Stats, StatsReducer};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Distinguishes successive connections of the same shard.
type ChannelId = u64;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shard {shard} out of range for {total} shards")]
    UnknownShard { shard: ShardIndex, total: usize },

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error("supervisor has stopped")]
    Stopped,
}

/// Why a new connection was turned away.
#[derive(Debug, thiserror::Error)]
enum IdentifyError {
    #[error("no identification frame within {0:?}")]
    Timeout(Duration),

    #[error("bad identification frame: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Lifecycle of one shard as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    Unlaunched,
    Launched,
    Authenticated,
    Connecting,
    Connected,
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    pub index: ShardIndex,
    pub state: ShardState,
    pub pid: Option<u32>,
    pub authenticated: bool,
    pub restarts: u32,
}

/// Point-in-time view of the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub shards: Vec<ShardSnapshot>,
    pub pending_aggregations: usize,
    pub shutting_down: bool,
}

impl FleetSnapshot {
    pub fn shard(&self, index: ShardIndex) -> Option<&ShardSnapshot> {
        self.shards.iter().find(|s| s.index == index)
    }

    pub fn authenticated(&self) -> usize {
        self.shards.iter().filter(|s| s.authenticated).count()
    }
}

#[derive(Debug)]
enum Command {
    LaunchAll,
    Launch(ShardIndex),
    ConnectAll,
    Connect { shard: ShardIndex, wait: Duration },
    Kill(ShardIndex),
    Restart,
    Shutdown,
    Snapshot(oneshot::Sender<FleetSnapshot>),
}

#[derive(Debug)]
enum Event {
    Command(Command),
    Attach {
        shard: ShardIndex,
        stream: TcpStream,
    },
    StatsRequest {
        origin: ShardIndex,
        channel: ChannelId,
        id: CallId,
    },
    StatsReply {
        origin: ShardIndex,
        seq: u64,
        from: ShardIndex,
        stats: Option<Stats>,
    },
    ConnectReply {
        shard: ShardIndex,
        channel: ChannelId,
        outcome: Result<bool, RpcError>,
    },
    TransportLost {
        shard: ShardIndex,
        channel: ChannelId,
    },
    ProcessExited {
        exit: ProcessExit,
        generation: u64,
    },
    Relaunch(ShardIndex),
    /// Shards still running this long after shutdown began get terminated.
    ShutdownGraceElapsed,
}

/// Cloneable control surface for a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    events: mpsc::UnboundedSender<Event>,
    total_shards: usize,
    single_connect_wait: Duration,
}

impl SupervisorHandle {
    fn send(&self, command: Command) -> Result<(), SupervisorError> {
        self.events
            .send(Event::Command(command))
            .map_err(|_| SupervisorError::Stopped)
    }

    fn check(&self, shard: ShardIndex) -> Result<ShardIndex, SupervisorError> {
        if shard >= self.total_shards {
            return Err(SupervisorError::UnknownShard {
                shard,
                total: self.total_shards,
            });
        }
        Ok(shard)
    }

    pub fn total_shards(&self) -> usize {
        self.total_shards
    }

    pub fn launch_all(&self) -> Result<(), SupervisorError> {
        self.send(Command::LaunchAll)
    }

    pub fn launch(&self, shard: ShardIndex) -> Result<(), SupervisorError> {
        let shard = self.check(shard)?;
        self.send(Command::Launch(shard))
    }

    /// `connect` every shard, staggering their waits.
    pub fn connect_all(&self) -> Result<(), SupervisorError> {
        self.send(Command::ConnectAll)
    }

    pub fn connect(&self, shard: ShardIndex, wait: Duration) -> Result<(), SupervisorError> {
        let shard = self.check(shard)?;
        self.send(Command::Connect { shard, wait })
    }

    pub fn kill(&self, shard: ShardIndex) -> Result<(), SupervisorError> {
        let shard = self.check(shard)?;
        self.send(Command::Kill(shard))
    }

    /// Kill every shard. Their processes are relaunched.
    pub fn restart(&self) -> Result<(), SupervisorError> {
        self.send(Command::Restart)
    }

    /// Stop every shard for good. [`Supervisor::run`] returns once all are gone.
    pub fn shutdown(&self) -> Result<(), SupervisorError> {
        self.send(Command::Shutdown)
    }

    pub async fn snapshot(&self) -> Result<FleetSnapshot, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Run an operator command. `stats` yields the snapshot it produced.
    pub async fn execute(
        &self,
        command: ConsoleCommand,
    ) -> Result<Option<FleetSnapshot>, SupervisorError> {
        match command.check_range(self.total_shards)? {
            ConsoleCommand::Quit => self.shutdown()?,
            ConsoleCommand::KillAll => self.restart()?,
            ConsoleCommand::KillShard(shard) => self.kill(shard)?,
            ConsoleCommand::ConnectAll => self.connect_all()?,
            ConsoleCommand::ConnectShard(shard) => self.connect(shard, self.single_connect_wait)?,
            ConsoleCommand::Start => self.launch_all()?,
            ConsoleCommand::Stats => return self.snapshot().await.map(Some),
        }
        Ok(None)
    }
}

/// Master-side record of one shard.
#[derive(Debug)]
struct ShardHandle {
    index: ShardIndex,
    state: ShardState,
    channel: Option<(ChannelId, RpcChannel)>,
    process: Option<ProcessHandle>,
    /// Bumped on every launch so exits of replaced processes are ignored.
    generation: u64,
    restarts: u32,
}

impl ShardHandle {
    fn new(index: ShardIndex) -> Self {
        Self {
            index,
            state: ShardState::Unlaunched,
            channel: None,
            process: None,
            generation: 0,
            restarts: 0,
        }
    }

    fn live_channel(&self) -> Option<&RpcChannel> {
        self.channel
            .as_ref()
            .map(|(_, channel)| channel)
            .filter(|channel| !channel.is_closed())
    }

    fn channel_is(&self, id: ChannelId) -> bool {
        matches!(self.channel, Some((current, _)) if current == id)
    }

    /// State once the channel is gone.
    fn detached_state(&self) -> ShardState {
        if self.process.is_some() {
            ShardState::Launched
        } else if self.generation > 0 {
            ShardState::Dead
        } else {
            ShardState::Unlaunched
        }
    }

    fn snapshot(&self) -> ShardSnapshot {
        ShardSnapshot {
            index: self.index,
            state: self.state,
            pid: self.process.as_ref().and_then(ProcessHandle::pid),
            authenticated: self.channel.is_some(),
            restarts: self.restarts,
        }
    }
}

struct PendingStats {
    seq: u64,
    /// Channel the request arrived on; the result goes back only there.
    channel: ChannelId,
    aggregation: Aggregation,
}

pub struct Supervisor {
    config: SupervisorConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    shards: BTreeMap<ShardIndex, ShardHandle>,
    quotas: Quotas,
    reducer: StatsReducer,
    aggregations: HashMap<ShardIndex, PendingStats>,
    next_channel: ChannelId,
    next_aggregation: u64,
    shutting_down: bool,
    events: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Validate `config` and bind the master listener.
    pub async fn bind(
        config: SupervisorConfig,
    ) -> Result<(Self, SupervisorHandle), SupervisorError> {
        config.validate()?;

        let addr = config.bind_addr();
        let bind_error = |source| SupervisorError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        tracing::info!(%local_addr, shards = config.total_shards, "Supervisor listening");

        let (events, events_rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle {
            events: events.clone(),
            total_shards: config.total_shards,
            single_connect_wait: config.single_connect_wait,
        };
        let supervisor = Self {
            shards: (0..config.total_shards)
                .map(|index| (index, ShardHandle::new(index)))
                .collect(),
            quotas: Quotas::new(&config.quotas),
            reducer: StatsReducer::default(),
            aggregations: HashMap::new(),
            next_channel: 0,
            next_aggregation: 0,
            shutting_down: false,
            listener: Some(listener),
            local_addr,
            events,
            events_rx,
            shutdown: CancellationToken::new(),
            config,
        };
        Ok((supervisor, handle))
    }

    /// Replace the stats classification table.
    pub fn with_reducer(mut self, reducer: StatsReducer) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until a shutdown has completed.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let listener = self.listener.take().ok_or(SupervisorError::Stopped)?;
        let acceptor = Acceptor {
            secret: Arc::from(self.config.secret.as_str()),
            total_shards: self.config.total_shards,
            timeout: self.config.identify_timeout,
            max_frame: self.config.max_identify_frame,
            events: self.events.clone(),
        };
        let accept_task = tokio::spawn(acceptor.run(listener, self.shutdown.clone()));
        self.quotas.spawn_refills(&self.shutdown);

        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event);
            if self.shutting_down && self.all_terminated() {
                tracing::info!("All shards terminated");
                break;
            }
        }

        self.shutdown.cancel();
        for handle in self.shards.values_mut() {
            if let Some((_, channel)) = handle.channel.take() {
                channel.close();
            }
        }
        if let Err(e) = accept_task.await {
            tracing::warn!(error = %e, "Accept task failed");
        }
        tracing::info!("Supervisor stopped");
        Ok(())
    }

    fn all_terminated(&self) -> bool {
        self.shards.values().all(|handle| handle.process.is_none())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.handle_command(command),
            Event::Attach { shard, stream } => self.attach(shard, stream),
            Event::StatsRequest {
                origin,
                channel,
                id,
            } => self.start_stats(origin, channel, id),
            Event::StatsReply {
                origin,
                seq,
                from,
                stats,
            } => self.record_stats(origin, seq, from, stats),
            Event::ConnectReply {
                shard,
                channel,
                outcome,
            } => self.connect_finished(shard, channel, outcome),
            Event::TransportLost { shard, channel } => self.transport_lost(shard, channel),
            Event::ProcessExited { exit, generation } => self.process_exited(exit, generation),
            Event::Relaunch(shard) => {
                let idle = self
                    .shards
                    .get(&shard)
                    .is_some_and(|handle| handle.process.is_none());
                if idle && !self.shutting_down {
                    self.launch(shard);
                }
            }
            Event::ShutdownGraceElapsed => self.terminate_stragglers(),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::LaunchAll => {
                for shard in 0..self.config.total_shards {
                    self.launch(shard);
                }
            }
            Command::Launch(shard) => self.launch(shard),
            Command::ConnectAll => {
                tracing::info!("Telling all shards to connect");
                for shard in 0..self.config.total_shards {
                    let wait = self.config.connect_stagger.saturating_mul(shard as u32);
                    self.connect(shard, wait);
                }
            }
            Command::Connect { shard, wait } => self.connect(shard, wait),
            Command::Kill(shard) => self.kill(shard),
            Command::Restart => {
                if self.shutting_down {
                    tracing::warn!("Shutdown in progress, ignoring restart");
                    return;
                }
                tracing::info!("Killing all shards");
                for shard in 0..self.config.total_shards {
                    self.kill(shard);
                }
            }
            Command::Shutdown => {
                if self.shutting_down {
                    return;
                }
                tracing::info!("Shutting down fleet");
                self.shutting_down = true;
                for shard in 0..self.config.total_shards {
                    self.kill(shard);
                }

                let grace = self.config.shutdown_grace;
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = events.send(Event::ShutdownGraceElapsed);
                });
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            shards: self.shards.values().map(ShardHandle::snapshot).collect(),
            pending_aggregations: self.aggregations.len(),
            shutting_down: self.shutting_down,
        }
    }

    fn launch(&mut self, shard: ShardIndex) {
        if self.shutting_down {
            tracing::warn!(shard, "Shutdown in progress, not launching");
            return;
        }
        let Some(handle) = self.shards.get_mut(&shard) else {
            return;
        };
        if handle.process.is_some() {
            tracing::debug!(shard, "Shard process already running");
            return;
        }

        let spawn_config = ShardSpawnConfig {
            shard,
            total_shards: self.config.total_shards,
            master_addr: self.local_addr,
        };
        match self.config.spawner.spawn(&spawn_config) {
            Ok(child) => {
                handle.generation += 1;
                let generation = handle.generation;
                let events = self.events.clone();
                let process = ProcessHandle::watch(shard, child, move |exit| {
                    let _ = events.send(Event::ProcessExited { exit, generation });
                });
                tracing::info!(shard, pid = ?process.pid(), "Launched shard");
                handle.process = Some(process);
                if handle.channel.is_none() {
                    handle.state = ShardState::Launched;
                }
            }
            Err(e) => {
                tracing::error!(shard, error = %e, "Failed to launch shard");
                handle.state = ShardState::Dead;
                self.schedule_relaunch(shard);
            }
        }
    }

    fn schedule_relaunch(&self, shard: ShardIndex) {
        let backoff = self.config.restart_backoff;
        let events = self.events.clone();
        tracing::info!(shard, ?backoff, "Relaunching shard after backoff");
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.send(Event::Relaunch(shard));
        });
    }

    fn process_exited(&mut self, exit: ProcessExit, generation: u64) {
        let shard = exit.shard;
        let Some(handle) = self.shards.get_mut(&shard) else {
            return;
        };
        if handle.generation != generation || handle.process.is_none() {
            return;
        }
        handle.process = None;
        handle.state = ShardState::Dead;

        match exit.status {
            Some(status) => tracing::warn!(shard, pid = ?exit.pid, %status, "Shard died"),
            None => tracing::warn!(shard, pid = ?exit.pid, "Shard died, status unknown"),
        }

        if self.shutting_down {
            let remaining = self
                .shards
                .values()
                .filter(|handle| handle.process.is_some())
                .count();
            tracing::info!(shard, remaining, "Shard terminated during shutdown");
            return;
        }
        handle.restarts += 1;
        self.schedule_relaunch(shard);
    }

    fn kill(&mut self, shard: ShardIndex) {
        let Some(handle) = self.shards.get_mut(&shard) else {
            return;
        };

        let told = handle
            .live_channel()
            .is_some_and(|channel| channel.notify(ShardCall::Die.as_str(), ()).is_ok());
        if told {
            tracing::info!(shard, "Commanding shard to die");
        } else if let Some(process) = handle.process.as_mut() {
            tracing::info!(shard, pid = ?process.pid(), "Shard not attached, terminating process");
            process.stop(Termination::Graceful);
        }
    }

    fn terminate_stragglers(&mut self) {
        for handle in self.shards.values_mut() {
            let Some(process) = handle.process.as_mut() else {
                continue;
            };
            if process.stop(Termination::Graceful) {
                tracing::warn!(
                    shard = handle.index,
                    pid = ?process.pid(),
                    grace = ?self.config.shutdown_grace,
                    "Shard ignored die, terminating process"
                );
            }
        }
    }

    fn connect(&mut self, shard: ShardIndex, wait: Duration) {
        let Some(handle) = self.shards.get_mut(&shard) else {
            return;
        };
        let Some((channel_id, channel)) = handle
            .channel
            .as_ref()
            .filter(|(_, channel)| !channel.is_closed())
            .map(|(id, channel)| (*id, channel.clone()))
        else {
            tracing::warn!(shard, "Shard is not attached, cannot connect it");
            return;
        };

        tracing::info!(shard, wait_secs = wait.as_secs(), "Commanding shard to connect");
        let params = ConnectParams {
            wait: wait.as_secs(),
        };
        match channel.call(ShardCall::Connect.as_str(), params) {
            Ok(reply) => {
                handle.state = ShardState::Connecting;
                let events = self.events.clone();
                tokio::spawn(async move {
                    let outcome = reply.decode::<bool>().await;
                    let _ = events.send(Event::ConnectReply {
                        shard,
                        channel: channel_id,
                        outcome,
                    });
                });
            }
            Err(e) => tracing::warn!(shard, error = %e, "Failed to send connect"),
        }
    }

    fn connect_finished(
        &mut self,
        shard: ShardIndex,
        channel: ChannelId,
        outcome: Result<bool, RpcError>,
    ) {
        let connected = match outcome {
            Ok(connected) => {
                tracing::info!(shard, connected, "Shard connect finished");
                connected
            }
            Err(e) => {
                tracing::warn!(shard, error = %e, "Shard connect failed");
                false
            }
        };

        if let Some(handle) = self.shards.get_mut(&shard)
            && handle.channel_is(channel)
        {
            handle.state = if connected {
                ShardState::Connected
            } else {
                ShardState::Authenticated
            };
        }
    }

    fn attach(&mut self, shard: ShardIndex, stream: TcpStream) {
        if !self.shards.contains_key(&shard) {
            return;
        }
        let channel_id = self.next_channel;
        self.next_channel += 1;

        let link = Arc::new(ShardLink {
            shard,
            channel: channel_id,
            quotas: self.quotas.clone(),
            events: self.events.clone(),
        });
        let channel = RpcChannel::from_tcp(stream, link, format!("shard-{shard}"));

        let Some(handle) = self.shards.get_mut(&shard) else {
            return;
        };
        if let Some((_, previous)) = handle.channel.replace((channel_id, channel.clone())) {
            tracing::info!(shard, "Replacing previous connection");
            previous.close();
            if let Some(pending) = self.aggregations.remove(&shard) {
                tracing::debug!(
                    shard,
                    waiters = pending.aggregation.waiters().len(),
                    "Dropping stats request of replaced connection"
                );
            }
        }
        handle.state = ShardState::Authenticated;

        if self.shutting_down {
            tracing::info!(shard, "Shard attached during shutdown, commanding it to die");
            if let Err(e) = channel.notify(ShardCall::Die.as_str(), ()) {
                tracing::warn!(shard, error = %e, "Failed to send die");
            }
            return;
        }

        let setup = SetupParams::from_interval(self.config.heartbeat_interval);
        if let Err(e) = channel.notify(ShardCall::Setup.as_str(), setup) {
            tracing::warn!(shard, error = %e, "Failed to send setup");
        }

        let authenticated = self
            .shards
            .values()
            .filter(|handle| handle.channel.is_some())
            .count();
        if authenticated == self.config.total_shards {
            tracing::info!(shard, "All shards identified, `connect` starts them");
        } else {
            tracing::info!(shard, authenticated, "Shard identified, `connect shard {shard}` starts it");
        }
    }

    fn transport_lost(&mut self, shard: ShardIndex, channel: ChannelId) {
        let Some(handle) = self.shards.get_mut(&shard) else {
            return;
        };
        if !handle.channel_is(channel) {
            return;
        }
        handle.channel = None;
        handle.state = handle.detached_state();
        tracing::warn!(shard, "Lost connection to shard");

        if let Some(pending) = self.aggregations.remove(&shard) {
            tracing::debug!(
                shard,
                waiters = pending.aggregation.waiters().len(),
                "Dropping stats request of disconnected shard"
            );
        }
    }

    fn start_stats(&mut self, origin: ShardIndex, channel: ChannelId, id: CallId) {
        let attached = self
            .shards
            .get(&origin)
            .is_some_and(|handle| handle.channel_is(channel));
        if !attached {
            tracing::debug!(shard = origin, call_id = id, "Stats request from stale connection");
            return;
        }

        if let Some(pending) = self.aggregations.get_mut(&origin) {
            if pending.channel == channel {
                pending.aggregation.add_waiter(id);
                tracing::debug!(shard = origin, call_id = id, "Joined outstanding stats request");
                return;
            }
            tracing::debug!(shard = origin, call_id = id, "Replacing stats request of an earlier connection");
            self.aggregations.remove(&origin);
        }

        let seq = self.next_aggregation;
        self.next_aggregation += 1;

        let targets: Vec<(ShardIndex, RpcChannel)> = self
            .shards
            .values()
            .filter_map(|handle| handle.live_channel().map(|c| (handle.index, c.clone())))
            .collect();
        let mut aggregation = Aggregation::new(origin, targets.iter().map(|(index, _)| *index), id);
        tracing::debug!(shard = origin, call_id = id, expected = aggregation.expected(), "Fanning out getStats");

        for (from, target) in targets {
            match target.call(ShardCall::GetStats.as_str(), ()) {
                Ok(reply) => {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let stats = match reply.decode::<Stats>().await {
                            Ok(stats) => Some(stats),
                            Err(e) => {
                                tracing::warn!(shard = from, error = %e, "Stats call failed");
                                None
                            }
                        };
                        let _ = events.send(Event::StatsReply {
                            origin,
                            seq,
                            from,
                            stats,
                        });
                    });
                }
                Err(e) => {
                    tracing::warn!(shard = from, error = %e, "Failed to request stats");
                    aggregation.record(from, None);
                }
            }
        }

        let pending = PendingStats {
            seq,
            channel,
            aggregation,
        };
        if pending.aggregation.is_complete() {
            self.finish_stats(pending);
        } else {
            self.aggregations.insert(origin, pending);
        }
    }

    fn record_stats(
        &mut self,
        origin: ShardIndex,
        seq: u64,
        from: ShardIndex,
        stats: Option<Stats>,
    ) {
        let Some(pending) = self.aggregations.get_mut(&origin) else {
            return;
        };
        if pending.seq != seq {
            return;
        }
        pending.aggregation.record(from, stats);
        if pending.aggregation.is_complete()
            && let Some(pending) = self.aggregations.remove(&origin)
        {
            self.finish_stats(pending);
        }
    }

    fn finish_stats(&self, pending: PendingStats) {
        let origin = pending.aggregation.origin();
        let collected = pending.aggregation.collected();
        let (waiters, stats) = pending.aggregation.finish(&self.reducer);

        let channel = self
            .shards
            .get(&origin)
            .filter(|handle| handle.channel_is(pending.channel))
            .and_then(ShardHandle::live_channel);
        let Some(channel) = channel else {
            tracing::debug!(shard = origin, "Stats requester went away");
            return;
        };

        tracing::debug!(shard = origin, collected, waiters = waiters.len(), "Sending fleet stats");
        for id in waiters {
            if let Err(e) = channel.send_result(&stats, id) {
                tracing::warn!(shard = origin, call_id = id, error = %e, "Failed to send stats");
            }
        }
    }
}

/// Call handler for one shard connection. Answers what needs no shared state and
/// forwards the rest to the supervisor.
struct ShardLink {
    shard: ShardIndex,
    channel: ChannelId,
    quotas: Quotas,
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl CallHandler for ShardLink {
    async fn handle_call(&self, channel: &RpcChannel, call: Call) -> Result<(), RpcError> {
        let Some(method) = MasterCall::from_method(&call.method) else {
            return Err(RpcError::UnknownCall(call.method));
        };
        let Some(id) = call.id else {
            return Err(RpcError::invalid_arguments(call.method, "call requires an id"));
        };

        match method {
            MasterCall::Ping => channel.send_result(true, id),
            MasterCall::GetStats => {
                let request = Event::StatsRequest {
                    origin: self.shard,
                    channel: self.channel,
                    id,
                };
                if self.events.send(request).is_err() {
                    tracing::debug!(shard = self.shard, "Supervisor stopped, dropping stats request");
                }
                Ok(())
            }
            MasterCall::RemoveWeatherToken
            | MasterCall::RemoveWolframToken
            | MasterCall::RemoveCleverbotToken => {
                let Some(resource) = Resource::from_call(method) else {
                    return Err(RpcError::UnknownCall(call.method));
                };
                let granted = self.quotas.try_acquire(resource);
                tracing::debug!(shard = self.shard, %resource, granted, "Token requested");
                channel.send_result(granted, id)
            }
        }
    }

    fn transport_error(&self, error: &RpcError) {
        if error.is_transport() {
            let _ = self.events.send(Event::TransportLost {
                shard: self.shard,
                channel: self.channel,
            });
        } else {
            tracing::warn!(shard = self.shard, error = %error, "Call from shard failed");
        }
    }
}

/// Accepts connections and authenticates them before the supervisor sees them.
#[derive(Clone)]
struct Acceptor {
    secret: Arc<str>,
    total_shards: usize,
    timeout: Duration,
    max_frame: usize,
    events: mpsc::UnboundedSender<Event>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let acceptor = self.clone();
                    tokio::spawn(async move { acceptor.admit(stream, peer).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        tracing::debug!("Accept loop stopped");
    }

    async fn admit(&self, mut stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(%peer, "New connection, authenticating");
        match self.identify(&mut stream).await {
            Ok(shard) => {
                tracing::info!(shard, %peer, "Shard authenticated");
                if self.events.send(Event::Attach { shard, stream }).is_err() {
                    tracing::debug!(shard, "Supervisor stopped, dropping connection");
                }
            }
            Err(IdentifyError::Auth(e)) => {
                tracing::warn!(shard = e.shard(), %peer, error = %e, "AuthenticationFailure, closing connection");
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Identification failed, closing connection");
            }
        }
    }

    async fn identify(&self, stream: &mut TcpStream) -> Result<ShardIndex, IdentifyError> {
        let identify: Identify =
            tokio::time::timeout(self.timeout, decode_frame_capped(stream, self.max_frame))
                .await
                .map_err(|_| IdentifyError::Timeout(self.timeout))??;
        auth::verify(&identify, &self.secret, self.total_shards)?;
        Ok(identify.shard_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{decode_frame, encode_frame};
    use crate::bridge::protocol::Envelope;
    use serde_json::{Value, json};
    use tokio::io::AsyncWriteExt;

    const SECRET: &str = "test-secret";

    async fn start(total: usize) -> (SupervisorHandle, SocketAddr) {
        let config = SupervisorConfig::new(total)
            .with_port(0)
            .with_secret(SECRET)
            .with_quota(Resource::Weather, crate::limiter::QuotaSpec::per_minute(1));
        let (supervisor, handle) = Supervisor::bind(config).await.unwrap();
        let addr = supervisor.local_addr();
        tokio::spawn(supervisor.run());
        (handle, addr)
    }

    async fn raw_shard(addr: SocketAddr, shard: ShardIndex, secret: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let frame = encode_frame(&auth::identify(secret, shard)).unwrap();
        stream.write_all(&frame).await.unwrap();
        stream
    }

    async fn next_envelope(stream: &mut TcpStream) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), decode_frame(stream))
            .await
            .expect("timed out")
            .unwrap()
    }

    async fn send(stream: &mut TcpStream, value: Value) {
        stream.write_all(&encode_frame(&value).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn attached_shard_receives_setup() {
        let (_handle, addr) = start(1).await;
        let mut stream = raw_shard(addr, 0, SECRET).await;

        match next_envelope(&mut stream).await {
            Envelope::Call(call) => {
                assert_eq!(call.method, "setup");
                assert_eq!(call.params["heartbeatInterval"], json!(50.0));
            }
            other => panic!("expected setup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_and_tokens_are_answered() {
        let (_handle, addr) = start(1).await;
        let mut stream = raw_shard(addr, 0, SECRET).await;
        next_envelope(&mut stream).await;

        send(&mut stream, json!({"method": "ping", "params": {}, "id": 0})).await;
        assert_eq!(next_envelope(&mut stream).await, Envelope::result(json!(true), 0));

        send(&mut stream, json!({"method": "removeWeatherToken", "params": {}, "id": 1})).await;
        assert_eq!(next_envelope(&mut stream).await, Envelope::result(json!(true), 1));
        send(&mut stream, json!({"method": "removeWeatherToken", "params": {}, "id": 2})).await;
        assert_eq!(next_envelope(&mut stream).await, Envelope::result(json!(false), 2));

        send(&mut stream, json!({"method": "removeWolframToken", "params": {}, "id": 3})).await;
        assert_eq!(next_envelope(&mut stream).await, Envelope::result(json!(true), 3));
    }

    #[tokio::test]
    async fn bad_calls_fail_without_closing() {
        let (_handle, addr) = start(1).await;
        let mut stream = raw_shard(addr, 0, SECRET).await;
        next_envelope(&mut stream).await;

        send(&mut stream, json!({"method": "launchMissiles", "params": {}, "id": 0})).await;
        match next_envelope(&mut stream).await {
            Envelope::Result(result) => {
                assert_eq!(result.id, 0);
                assert!(result.result["error"].as_str().unwrap().contains("launchMissiles"));
            }
            other => panic!("expected error result, got {other:?}"),
        }

        // No id: nothing to answer, but the connection survives.
        send(&mut stream, json!({"method": "ping", "params": {}})).await;
        send(&mut stream, json!({"method": "ping", "params": {}, "id": 1})).await;
        assert_eq!(next_envelope(&mut stream).await, Envelope::result(json!(true), 1));
    }

    #[tokio::test]
    async fn lone_shard_gets_its_own_stats() {
        let (handle, addr) = start(1).await;
        let mut stream = raw_shard(addr, 0, SECRET).await;
        next_envelope(&mut stream).await;

        send(&mut stream, json!({"method": "getStats", "params": {}, "id": 9})).await;
        let request = match next_envelope(&mut stream).await {
            Envelope::Call(call) if call.method == "getStats" => call,
            other => panic!("expected getStats fan-out, got {other:?}"),
        };
        send(
            &mut stream,
            json!({"result": {"shardNum": 0, "numberOfGuilds": 4}, "id": request.id}),
        )
        .await;

        assert_eq!(
            next_envelope(&mut stream).await,
            Envelope::result(json!({"shardNum": 0, "numberOfGuilds": 4}), 9)
        );
        assert_eq!(handle.snapshot().await.unwrap().pending_aggregations, 0);
    }

    #[tokio::test]
    async fn stats_wait_only_for_attached_shards() {
        let (handle, addr) = start(3).await;
        let mut stream = raw_shard(addr, 2, SECRET).await;
        next_envelope(&mut stream).await;

        send(&mut stream, json!({"method": "getStats", "params": {}, "id": 4})).await;
        let request = match next_envelope(&mut stream).await {
            Envelope::Call(call) if call.method == "getStats" => call,
            other => panic!("expected getStats fan-out, got {other:?}"),
        };
        send(&mut stream, json!({"result": {"x": 3}, "id": request.id})).await;

        // Shards 0 and 1 never attached, so nothing is owed by them.
        assert_eq!(
            next_envelope(&mut stream).await,
            Envelope::result(json!({"x": 3}), 4)
        );
        assert_eq!(handle.snapshot().await.unwrap().pending_aggregations, 0);
    }

    #[tokio::test]
    async fn repeated_stats_requests_share_one_fan_out() {
        let (_handle, addr) = start(1).await;
        let mut stream = raw_shard(addr, 0, SECRET).await;
        next_envelope(&mut stream).await;

        send(&mut stream, json!({"method": "getStats", "params": {}, "id": 1})).await;
        let request = match next_envelope(&mut stream).await {
            Envelope::Call(call) => call,
            other => panic!("expected getStats fan-out, got {other:?}"),
        };
        send(&mut stream, json!({"method": "getStats", "params": {}, "id": 2})).await;
        send(&mut stream, json!({"method": "ping", "params": {}, "id": 3})).await;
        // The second request joins the first instead of fanning out again.
        assert_eq!(next_envelope(&mut stream).await, Envelope::result(json!(true), 3));

        send(&mut stream, json!({"result": {"x": 1}, "id": request.id})).await;
        let mut answered = vec![];
        for _ in 0..2 {
            match next_envelope(&mut stream).await {
                Envelope::Result(result) => {
                    assert_eq!(result.result, json!({"x": 1}));
                    answered.push(result.id);
                }
                other => panic!("expected stats result, got {other:?}"),
            }
        }
        answered.sort();
        assert_eq!(answered, vec![1, 2]);
    }

    async fn next_call(stream: &mut TcpStream, method: &str) -> Call {
        match next_envelope(stream).await {
            Envelope::Call(call) if call.method == method => call,
            other => panic!("expected {method}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reattached_shard_gets_answered_despite_earlier_request() {
        let (handle, addr) = start(2).await;
        let mut first = raw_shard(addr, 0, SECRET).await;
        next_call(&mut first, "setup").await;
        let mut other = raw_shard(addr, 1, SECRET).await;
        next_call(&mut other, "setup").await;

        send(&mut first, json!({"method": "getStats", "params": {}, "id": 1})).await;
        next_call(&mut first, "getStats").await;
        let abandoned = next_call(&mut other, "getStats").await;

        let mut second = raw_shard(addr, 0, SECRET).await;
        next_call(&mut second, "setup").await;
        send(&mut second, json!({"method": "getStats", "params": {}, "id": 5})).await;
        let own = next_call(&mut second, "getStats").await;
        let fresh = next_call(&mut other, "getStats").await;

        send(&mut other, json!({"result": {"x": 100}, "id": abandoned.id})).await;
        send(&mut other, json!({"result": {"x": 2}, "id": fresh.id})).await;
        send(&mut second, json!({"result": {"x": 10}, "id": own.id})).await;

        assert_eq!(
            next_envelope(&mut second).await,
            Envelope::result(json!({"x": 12}), 5)
        );
        assert_eq!(handle.snapshot().await.unwrap().pending_aggregations, 0);
    }

    #[tokio::test]
    async fn snapshot_reflects_attachment() {
        let (handle, addr) = start(2).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.shards.len(), 2);
        assert_eq!(snapshot.authenticated(), 0);
        assert_eq!(snapshot.shard(1).unwrap().state, ShardState::Unlaunched);

        let mut stream = raw_shard(addr, 1, SECRET).await;
        next_envelope(&mut stream).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.shard(1).unwrap().state, ShardState::Authenticated);
        assert!(snapshot.shard(1).unwrap().authenticated);

        drop(stream);
        for _ in 0..100 {
            let snapshot = handle.snapshot().await.unwrap();
            if !snapshot.shard(1).unwrap().authenticated {
                assert_eq!(snapshot.shard(1).unwrap().state, ShardState::Unlaunched);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("disconnect never observed");
    }

    #[tokio::test]
    async fn handle_rejects_out_of_range_shards() {
        let (handle, _addr) = start(2).await;
        assert!(matches!(
            handle.kill(2),
            Err(SupervisorError::UnknownShard { shard: 2, total: 2 })
        ));
        assert!(matches!(
            handle.execute(ConsoleCommand::ConnectShard(5)).await,
            Err(SupervisorError::Console(_))
        ));
        assert!(handle.execute(ConsoleCommand::Stats).await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shard_ignoring_die_is_terminated_after_the_grace() {
        let spawner = crate::process::CommandSpawner::new("sleep").with_args(["30"]);
        let config = SupervisorConfig::new(1)
            .with_port(0)
            .with_secret(SECRET)
            .with_spawner(Arc::new(spawner))
            .with_shutdown_grace(Duration::from_millis(200));
        let (supervisor, handle) = Supervisor::bind(config).await.unwrap();
        let addr = supervisor.local_addr();
        let run = tokio::spawn(supervisor.run());

        handle.launch_all().unwrap();
        let mut stream = raw_shard(addr, 0, SECRET).await;
        next_call(&mut stream, "setup").await;
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.shard(0).unwrap().pid.is_some());

        handle.shutdown().unwrap();
        next_call(&mut stream, "die").await;
        // The process never sees `die`; only the grace timer can end it.
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("shutdown never completed")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_nothing_running_stops_supervisor() {
        let config = SupervisorConfig::new(1).with_port(0);
        let (supervisor, handle) = Supervisor::bind(config).await.unwrap();
        let run = tokio::spawn(supervisor.run());

        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(handle.launch_all(), Err(SupervisorError::Stopped)));
    }
}
