//! Token buckets gating calls to scarce external resources.
//!
//! The master owns one bucket per [`Resource`]. Shards reach buckets only through RPC,
//! so quota is enforced in one place rather than raced over by every shard.
//!
//! Refill policy: the bucket is topped back up to capacity once per interval.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::MasterCall;

/// Shortest refill period accepted; tokio intervals cannot tick at zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Capacity and cadence of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSpec {
    pub capacity: u32,
    pub interval: Duration,
}

impl QuotaSpec {
    pub const fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            interval: Duration::from_secs(60),
        }
    }

    pub const fn per_day(capacity: u32) -> Self {
        Self {
            capacity,
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Refillable pool of integer tokens. Never blocks.
pub struct TokenBucket {
    name: String,
    capacity: u32,
    interval: Duration,
    tokens: AtomicU32,
    refill_scheduled: AtomicBool,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("interval", &self.interval)
            .field("tokens", &self.tokens_remaining())
            .finish()
    }
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(name: impl Into<String>, spec: QuotaSpec) -> Self {
        Self {
            name: name.into(),
            capacity: spec.capacity,
            interval: spec.interval.max(MIN_INTERVAL),
            tokens: AtomicU32::new(spec.capacity),
            refill_scheduled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn tokens_remaining(&self) -> u32 {
        self.tokens.load(Ordering::Acquire)
    }

    pub fn is_refill_scheduled(&self) -> bool {
        self.refill_scheduled.load(Ordering::Acquire)
    }

    /// Take one token if any are left.
    pub fn try_remove_token(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
            .is_ok()
    }

    pub fn refill(&self) {
        self.tokens.store(self.capacity, Ordering::Release);
    }

    /// Refill on the bucket's cadence until `shutdown` fires.
    ///
    /// Returns `None` if a refill task is already running for this bucket.
    pub fn spawn_refill(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.refill_scheduled.swap(true, Ordering::AcqRel) {
            return None;
        }

        let bucket = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + bucket.interval, bucket.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        bucket.refill();
                        tracing::trace!(bucket = %bucket.name, capacity = bucket.capacity, "Bucket refilled");
                    }
                }
            }
            bucket.refill_scheduled.store(false, Ordering::Release);
        }))
    }
}

/// External resources whose quota the master arbitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Weather,
    Wolfram,
    Cleverbot,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Weather, Resource::Wolfram, Resource::Cleverbot];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weather => "weather",
            Self::Wolfram => "wolfram",
            Self::Cleverbot => "cleverbot",
        }
    }

    /// The master call a shard uses to take a token of this resource.
    pub fn call(&self) -> MasterCall {
        match self {
            Self::Weather => MasterCall::RemoveWeatherToken,
            Self::Wolfram => MasterCall::RemoveWolframToken,
            Self::Cleverbot => MasterCall::RemoveCleverbotToken,
        }
    }

    pub fn from_call(call: MasterCall) -> Option<Self> {
        match call {
            MasterCall::RemoveWeatherToken => Some(Self::Weather),
            MasterCall::RemoveWolframToken => Some(Self::Wolfram),
            MasterCall::RemoveCleverbotToken => Some(Self::Cleverbot),
            MasterCall::GetStats | MasterCall::Ping => None,
        }
    }

    pub fn default_quota(&self) -> QuotaSpec {
        match self {
            Self::Weather => QuotaSpec::per_minute(10),
            Self::Wolfram => QuotaSpec::per_day(67),
            Self::Cleverbot => QuotaSpec::per_minute(30),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bucket per resource.
#[derive(Debug, Clone)]
pub struct Quotas {
    buckets: BTreeMap<Resource, Arc<TokenBucket>>,
}

impl Default for Quotas {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

impl Quotas {
    /// Buckets from `specs`, falling back to each resource's default quota.
    pub fn new(specs: &BTreeMap<Resource, QuotaSpec>) -> Self {
        let buckets = Resource::ALL
            .into_iter()
            .map(|resource| {
                let spec = specs
                    .get(&resource)
                    .copied()
                    .unwrap_or_else(|| resource.default_quota());
                (resource, Arc::new(TokenBucket::new(resource.as_str(), spec)))
            })
            .collect();
        Self { buckets }
    }

    pub fn bucket(&self, resource: Resource) -> &Arc<TokenBucket> {
        // Every resource gets a bucket in `new`.
        &self.buckets[&resource]
    }

    pub fn try_acquire(&self, resource: Resource) -> bool {
        self.bucket(resource).try_remove_token()
    }

    pub fn spawn_refills(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.buckets
            .values()
            .filter_map(|bucket| bucket.spawn_refill(shutdown.clone()))
            .collect()
    }
}
