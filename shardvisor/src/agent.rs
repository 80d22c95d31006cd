//! Shard agent - the shard side of the fleet.
//!
//! The agent keeps one connection to the master. It identifies itself, waits for
//! `setup`, then heartbeats. When the connection drops or pings go unanswered it
//! enters orphaned mode: quota requests are refused, stats cover this shard alone,
//! and reattachment is retried every `retry_delay` until a new `setup` arrives.
//!
//! States: `Orphaned -> Identifying -> Attached -> Orphaned`.
//!
//! [`ShardAgent`] is an actor like the supervisor. Its state is published through a
//! `watch` channel that [`AgentHandle`] reads.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::bridge::protocol::{
    Call, ConnectParams, MasterCall, SetupParams, ShardCall, ShardIndex,
};
use crate::bridge::{CallHandler, FrameError, RpcChannel, RpcError, encode_frame};
use crate::config::{AgentConfig, ConfigError};
use crate::console::ShardCommand;
use crate::gateway::Gateway;
use crate::limiter::{Resource, TokenBucket};
use crate::stats::Stats;

type ChannelId = u64;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to reach master at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out reaching master at {0}")]
    ConnectTimeout(String),

    #[error("failed to encode identification: {0}")]
    Identify(#[from] FrameError),

    #[error("fleet stats request failed: {0}")]
    FleetStats(Arc<RpcError>),

    #[error("agent has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// No usable connection to the master.
    Orphaned,
    /// Connected and identified, waiting for `setup`.
    Identifying,
    /// Heartbeating with the master.
    Attached,
}

/// Why [`ShardAgent::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// The master sent `die`.
    Die,
    /// [`AgentHandle::shutdown`] was called.
    Shutdown,
}

#[derive(Debug, Clone)]
struct AgentStatus {
    state: AgentState,
    /// Present only while attached.
    channel: Option<RpcChannel>,
}

#[derive(Debug)]
enum Event {
    Setup {
        channel: ChannelId,
        interval: Duration,
    },
    Die,
    TransportLost {
        channel: ChannelId,
    },
    HeartbeatLost {
        channel: ChannelId,
    },
    TryUnorphan,
}

/// What the run loop does after an event.
enum Flow {
    Continue,
    Unorphan,
    Exit(AgentExit),
}

/// Stats describing this shard: the gateway's counters plus fleet identity keys.
fn shard_stats(gateway: &dyn Gateway, shard: ShardIndex, total: usize, orphan: bool) -> Stats {
    let mut stats = gateway.stats();
    stats.insert("shardNum".into(), Value::from(shard));
    stats.insert("shards".into(), Value::from(total));
    stats.insert("orphan".into(), Value::from(orphan));
    stats
}

type StatsFlight = Shared<BoxFuture<'static, Result<Stats, Arc<RpcError>>>>;

/// Collaborator-facing view of a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    shard: ShardIndex,
    total_shards: usize,
    gateway: Arc<dyn Gateway>,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<AgentStatus>,
    flight: Arc<StdMutex<Option<(u64, StatsFlight)>>>,
    flight_seq: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("shard", &self.shard)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn state(&self) -> AgentState {
        self.status.borrow().state
    }

    pub fn is_orphaned(&self) -> bool {
        self.state() != AgentState::Attached
    }

    /// Wait until the agent reaches `state`.
    pub async fn wait_for(&self, state: AgentState) -> Result<(), AgentError> {
        let mut status = self.status.clone();
        status
            .wait_for(|status| status.state == state)
            .await
            .map(|_| ())
            .map_err(|_| AgentError::Stopped)
    }

    fn attached_channel(&self) -> Option<RpcChannel> {
        let status = self.status.borrow();
        match status.state {
            AgentState::Attached => status.channel.clone(),
            _ => None,
        }
    }

    /// Ask the master for one token of `resource`.
    ///
    /// False while orphaned and on any RPC failure.
    pub async fn request_quota(&self, resource: Resource) -> bool {
        let Some(channel) = self.attached_channel() else {
            tracing::debug!(shard = self.shard, %resource, "Orphaned, refusing token");
            return false;
        };
        let reply = match channel.call(resource.call().as_str(), ()) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(shard = self.shard, %resource, error = %e, "Token request not sent");
                return false;
            }
        };
        match reply.decode::<bool>().await {
            Ok(granted) => granted,
            Err(e) => {
                tracing::warn!(shard = self.shard, %resource, error = %e, "Token request failed");
                false
            }
        }
    }

    /// Stats for this shard alone.
    pub fn local_stats(&self) -> Stats {
        shard_stats(
            self.gateway.as_ref(),
            self.shard,
            self.total_shards,
            self.is_orphaned(),
        )
    }

    /// Fleet-wide stats, or this shard's own while orphaned.
    ///
    /// Concurrent callers share one in-flight request.
    pub async fn fleet_stats(&self) -> Result<Stats, AgentError> {
        let Some(channel) = self.attached_channel() else {
            return Ok(self.local_stats());
        };

        let (seq, flight) = {
            let mut slot = self.lock_flight();
            match slot.as_ref() {
                Some((seq, flight)) => (*seq, flight.clone()),
                None => {
                    let seq = self.flight_seq.fetch_add(1, Ordering::Relaxed);
                    let reply = channel.call(MasterCall::GetStats.as_str(), ());
                    let flight = async move {
                        match reply {
                            Ok(reply) => reply.decode::<Stats>().await.map_err(Arc::new),
                            Err(e) => Err(Arc::new(e)),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some((seq, flight.clone()));
                    (seq, flight)
                }
            }
        };

        let result = flight.await;
        let mut slot = self.lock_flight();
        if matches!(slot.as_ref(), Some((current, _)) if *current == seq) {
            *slot = None;
        }
        result.map_err(AgentError::FleetStats)
    }

    /// Attempt reattachment now instead of at the next retry tick.
    pub fn try_unorphan(&self) -> Result<(), AgentError> {
        self.events
            .send(Event::TryUnorphan)
            .map_err(|_| AgentError::Stopped)
    }

    /// Disconnect the gateway and stop the agent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Connect the gateway locally, with no `connect` from the master to answer.
    pub async fn jumpstart(&self) -> bool {
        if self.gateway.is_connected() {
            return true;
        }
        tracing::info!(shard = self.shard, "Jumpstarting gateway");
        let connected = self.gateway.connect().await;
        tracing::info!(shard = self.shard, connected, "Gateway connect finished");
        connected
    }

    /// Run a command from the shard's console.
    pub async fn execute(&self, command: ShardCommand) -> Result<(), AgentError> {
        match command {
            ShardCommand::Die => self.shutdown(),
            ShardCommand::Jumpstart => {
                self.jumpstart().await;
            }
            ShardCommand::TryUnorphan => self.try_unorphan()?,
        }
        Ok(())
    }

    fn lock_flight(&self) -> MutexGuard<'_, Option<(u64, StatsFlight)>> {
        self.flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ShardAgent {
    config: AgentConfig,
    gateway: Arc<dyn Gateway>,
    status: watch::Sender<AgentStatus>,
    channel: Option<(ChannelId, RpcChannel)>,
    next_channel: ChannelId,
    heartbeat: Option<CancellationToken>,
    adopt: Arc<TokenBucket>,
    events: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
}

impl ShardAgent {
    pub fn new(
        config: AgentConfig,
        gateway: Arc<dyn Gateway>,
    ) -> Result<(Self, AgentHandle), AgentError> {
        config.validate()?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(AgentStatus {
            state: AgentState::Orphaned,
            channel: None,
        });
        let shutdown = CancellationToken::new();
        let handle = AgentHandle {
            shard: config.shard_index,
            total_shards: config.total_shards,
            gateway: Arc::clone(&gateway),
            events: events.clone(),
            status: status_rx,
            flight: Arc::new(StdMutex::new(None)),
            flight_seq: Arc::new(AtomicU64::new(0)),
            shutdown: shutdown.clone(),
        };
        let agent = Self {
            adopt: Arc::new(TokenBucket::new("adopt", config.adopt_quota)),
            config,
            gateway,
            status,
            channel: None,
            next_channel: 0,
            heartbeat: None,
            events,
            events_rx,
            shutdown,
        };
        Ok((agent, handle))
    }

    fn shard(&self) -> ShardIndex {
        self.config.shard_index
    }

    fn state(&self) -> AgentState {
        self.status.borrow().state
    }

    fn set_state(&mut self, state: AgentState) {
        let channel = match state {
            AgentState::Attached => self.channel.as_ref().map(|(_, channel)| channel.clone()),
            _ => None,
        };
        self.status.send_replace(AgentStatus { state, channel });
    }

    fn is_current(&self, channel: ChannelId) -> bool {
        matches!(self.channel, Some((current, _)) if current == channel)
    }

    /// Run until `die` or [`AgentHandle::shutdown`].
    pub async fn run(mut self) -> Result<AgentExit, AgentError> {
        let _refill = self.adopt.spawn_refill(self.shutdown.child_token());
        let retry_delay = self.config.retry_delay;
        tracing::info!(shard = self.shard(), total = self.config.total_shards, master = %self.config.master_addr(), "Shard agent starting");

        self.unorphan().await;
        let mut retry =
            tokio::time::interval_at(tokio::time::Instant::now() + retry_delay, retry_delay);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let flow = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => Flow::Exit(AgentExit::Shutdown),
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    // Unreachable while the agent holds a sender.
                    None => Flow::Exit(AgentExit::Shutdown),
                },
                _ = retry.tick() => {
                    if self.state() == AgentState::Attached {
                        Flow::Continue
                    } else {
                        Flow::Unorphan
                    }
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Unorphan => {
                    self.unorphan().await;
                    retry.reset();
                }
                Flow::Exit(exit) => break exit,
            }
        };

        self.stop_heartbeat();
        self.gateway.disconnect().await;
        if let Some((_, channel)) = self.channel.take() {
            channel.close();
        }
        self.set_state(AgentState::Orphaned);
        self.shutdown.cancel();
        tracing::info!(shard = self.shard(), ?exit, "Shard agent stopped");
        Ok(exit)
    }

    fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Setup { channel, interval } => {
                if self.is_current(channel) {
                    self.start_heartbeat(channel, interval);
                }
                Flow::Continue
            }
            Event::Die => {
                tracing::info!(shard = self.shard(), "Got notification that we should die");
                Flow::Exit(AgentExit::Die)
            }
            Event::TransportLost { channel } | Event::HeartbeatLost { channel } => {
                if !self.is_current(channel) {
                    return Flow::Continue;
                }
                match self.state() {
                    AgentState::Attached => self.orphan(),
                    _ => {
                        // Never attached on this connection; wait for the next retry.
                        if let Some((_, channel)) = self.channel.take() {
                            channel.close();
                        }
                        self.set_state(AgentState::Orphaned);
                        Flow::Continue
                    }
                }
            }
            Event::TryUnorphan => match self.state() {
                AgentState::Attached => Flow::Continue,
                _ => Flow::Unorphan,
            },
        }
    }

    /// Drop the master connection and enter orphaned mode.
    ///
    /// Reattachment starts at once while the adopt bucket has tokens, otherwise at
    /// the next retry tick.
    fn orphan(&mut self) -> Flow {
        if self.state() == AgentState::Orphaned {
            return Flow::Continue;
        }
        self.stop_heartbeat();
        if let Some((_, channel)) = self.channel.take() {
            channel.close();
        }
        self.set_state(AgentState::Orphaned);

        if self.adopt.try_remove_token() {
            tracing::warn!(
                shard = self.shard(),
                tokens_left = self.adopt.tokens_remaining(),
                "Putting shard into orphaned mode"
            );
            Flow::Unorphan
        } else {
            tracing::warn!(
                shard = self.shard(),
                retry_in = ?self.config.retry_delay,
                "Orphaned too often, waiting before reattaching"
            );
            Flow::Continue
        }
    }

    /// Open a fresh connection to the master and identify. No-op while attached.
    async fn unorphan(&mut self) {
        if self.state() == AgentState::Attached {
            return;
        }
        if let Some((_, stale)) = self.channel.take() {
            stale.close();
        }

        match self.open_channel().await {
            Ok(()) => {
                tracing::info!(shard = self.shard(), "Identified with master, waiting for setup");
                self.set_state(AgentState::Identifying);
            }
            Err(e) => {
                tracing::warn!(
                    shard = self.shard(),
                    error = %e,
                    retry_in = ?self.config.retry_delay,
                    "Failed to reach master"
                );
                self.set_state(AgentState::Orphaned);
            }
        }
    }

    async fn open_channel(&mut self) -> Result<(), AgentError> {
        let addr = self.config.master_addr();
        let connect_error = |source: std::io::Error| AgentError::Connect {
            addr: addr.clone(),
            source,
        };

        let mut stream = tokio::time::timeout(self.config.retry_delay, TcpStream::connect(&addr))
            .await
            .map_err(|_| AgentError::ConnectTimeout(addr.clone()))?
            .map_err(connect_error)?;
        let frame = encode_frame(&auth::identify(&self.config.secret, self.shard()))?;
        stream.write_all(&frame).await.map_err(connect_error)?;

        let id = self.next_channel;
        self.next_channel += 1;
        let link = Arc::new(MasterLink {
            shard: self.shard(),
            total_shards: self.config.total_shards,
            channel: id,
            gateway: Arc::clone(&self.gateway),
            status: self.status.subscribe(),
            events: self.events.clone(),
        });
        let channel = RpcChannel::from_tcp(stream, link, "master");
        self.channel = Some((id, channel));
        Ok(())
    }

    fn start_heartbeat(&mut self, channel_id: ChannelId, interval: Duration) {
        self.stop_heartbeat();
        let Some((_, channel)) = self.channel.as_ref() else {
            return;
        };

        let stop = self.shutdown.child_token();
        tokio::spawn(heartbeat(
            self.shard(),
            channel.clone(),
            channel_id,
            interval,
            self.config.max_missed_pings,
            self.events.clone(),
            stop.clone(),
        ));
        self.heartbeat = Some(stop);
        self.set_state(AgentState::Attached);
        tracing::info!(shard = self.shard(), ?interval, "Attached to master");
    }

    fn stop_heartbeat(&mut self) {
        if let Some(stop) = self.heartbeat.take() {
            stop.cancel();
        }
    }
}

/// Ping the master every `period`. Reports `HeartbeatLost` once `max_missed` pings in
/// a row have gone unanswered.
async fn heartbeat(
    shard: ShardIndex,
    channel: RpcChannel,
    channel_id: ChannelId,
    period: Duration,
    max_missed: u32,
    events: mpsc::UnboundedSender<Event>,
    stop: CancellationToken,
) {
    let missed = Arc::new(AtomicU32::new(0));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let unanswered = missed.load(Ordering::Acquire);
        if unanswered >= max_missed {
            tracing::warn!(shard, missed = unanswered, "Missed too many pings");
            let _ = events.send(Event::HeartbeatLost {
                channel: channel_id,
            });
            return;
        }
        missed.fetch_add(1, Ordering::AcqRel);

        match channel.call(MasterCall::Ping.as_str(), ()) {
            Ok(reply) => {
                let missed = Arc::clone(&missed);
                tokio::spawn(async move {
                    if let Ok(true) = reply.decode::<bool>().await {
                        missed.store(0, Ordering::Release);
                    }
                });
            }
            Err(e) => {
                tracing::debug!(shard, error = %e, "Ping not sent");
            }
        }
    }
}

/// Call handler for the connection to the master.
struct MasterLink {
    shard: ShardIndex,
    total_shards: usize,
    channel: ChannelId,
    gateway: Arc<dyn Gateway>,
    status: watch::Receiver<AgentStatus>,
    events: mpsc::UnboundedSender<Event>,
}

impl MasterLink {
    fn forward(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::debug!(shard = self.shard, "Agent stopped, dropping event");
        }
    }
}

#[async_trait]
impl CallHandler for MasterLink {
    async fn handle_call(&self, channel: &RpcChannel, call: Call) -> Result<(), RpcError> {
        let Some(method) = ShardCall::from_method(&call.method) else {
            return Err(RpcError::UnknownCall(call.method));
        };

        match method {
            ShardCall::Setup => {
                let params: SetupParams = serde_json::from_value(Value::Object(call.params))
                    .map_err(|e| RpcError::invalid_arguments(method.as_str(), e))?;
                let interval = params.interval().ok_or_else(|| {
                    RpcError::invalid_arguments(method.as_str(), "heartbeatInterval must be positive")
                })?;
                self.forward(Event::Setup {
                    channel: self.channel,
                    interval,
                });
                Ok(())
            }
            ShardCall::Die => {
                self.forward(Event::Die);
                Ok(())
            }
            ShardCall::GetStats => {
                let id = call
                    .id
                    .ok_or_else(|| RpcError::invalid_arguments(method.as_str(), "call requires an id"))?;
                let orphan = self.status.borrow().state != AgentState::Attached;
                let stats = shard_stats(self.gateway.as_ref(), self.shard, self.total_shards, orphan);
                channel.send_result(stats, id)
            }
            ShardCall::Connect => {
                let id = call
                    .id
                    .ok_or_else(|| RpcError::invalid_arguments(method.as_str(), "call requires an id"))?;
                let params: ConnectParams = serde_json::from_value(Value::Object(call.params))
                    .map_err(|e| RpcError::invalid_arguments(method.as_str(), e))?;

                if self.gateway.is_connected() {
                    tracing::info!(shard = self.shard, "Gateway already connected");
                    return channel.send_result(true, id);
                }

                tracing::info!(shard = self.shard, wait_secs = params.wait, "Got connect command");
                let gateway = Arc::clone(&self.gateway);
                let channel = channel.clone();
                let shard = self.shard;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(params.wait)).await;
                    let connected = gateway.connect().await;
                    tracing::info!(shard, connected, "Gateway connect finished");
                    if let Err(e) = channel.send_result(connected, id) {
                        tracing::warn!(shard, error = %e, "Failed to report connect result");
                    }
                });
                Ok(())
            }
        }
    }

    fn transport_error(&self, error: &RpcError) {
        if error.is_transport() {
            self.forward(Event::TransportLost {
                channel: self.channel,
            });
        } else {
            tracing::warn!(shard = self.shard, error = %error, "Call from master failed");
        }
    }
}
