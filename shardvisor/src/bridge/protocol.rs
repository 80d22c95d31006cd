//! Wire protocol types for master/shard communication.
//!
//! Every frame carries one [`Envelope`]: a [`Call`] or a [`CallResult`]. The only
//! exception is the first frame a shard sends on a fresh connection, which is an
//! [`Identify`] handshake.
//!
//! Method names travel as strings so any peer speaking the framing can take part;
//! [`MasterCall`] and [`ShardCall`] give each side a closed set to dispatch on.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-channel call identifier. Each side of a connection counts its own.
pub type CallId = u64;

/// Index of a shard within the fleet, `0..total_shards`.
pub type ShardIndex = usize;

/// One message on the wire.
///
/// Exactly one shape must match: an object carrying both `method` and `result`, or
/// neither, fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Call(Call),
    Result(CallResult),
}

impl Envelope {
    pub fn call(method: impl Into<String>, params: Map<String, Value>, id: CallId) -> Self {
        Self::Call(Call {
            method: method.into(),
            params,
            id: Some(id),
        })
    }

    pub fn result(result: Value, id: CallId) -> Self {
        Self::Result(CallResult { result, id })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Call {
    pub method: String,
    pub params: Map<String, Value>,
    /// Always sent by this crate. Tolerated as absent from other peers, in which case
    /// the call cannot be answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallResult {
    pub result: Value,
    pub id: CallId,
}

/// Result payload used to answer a call that failed on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteError {
    pub error: String,
}

impl RemoteError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Recognise an error reply among ordinary results.
    pub fn from_result(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) if map.len() == 1 && map.contains_key("error") => {
                serde_json::from_value(value.clone()).ok()
            }
            _ => None,
        }
    }
}

/// Handshake frame a shard sends before anything else on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub shard_index: ShardIndex,
    pub password_hash: String,
}

/// Calls a shard makes on the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterCall {
    GetStats,
    Ping,
    RemoveWeatherToken,
    RemoveWolframToken,
    RemoveCleverbotToken,
}

impl MasterCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetStats => "getStats",
            Self::Ping => "ping",
            Self::RemoveWeatherToken => "removeWeatherToken",
            Self::RemoveWolframToken => "removeWolframToken",
            Self::RemoveCleverbotToken => "removeCleverbotToken",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "getStats" => Some(Self::GetStats),
            "ping" => Some(Self::Ping),
            "removeWeatherToken" => Some(Self::RemoveWeatherToken),
            "removeWolframToken" => Some(Self::RemoveWolframToken),
            "removeCleverbotToken" => Some(Self::RemoveCleverbotToken),
            _ => None,
        }
    }
}

/// Calls the master makes on a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardCall {
    Connect,
    Die,
    GetStats,
    Setup,
}

impl ShardCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Die => "die",
            Self::GetStats => "getStats",
            Self::Setup => "setup",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "connect" => Some(Self::Connect),
            "die" => Some(Self::Die),
            "getStats" => Some(Self::GetStats),
            "setup" => Some(Self::Setup),
            _ => None,
        }
    }
}

/// Parameters of `setup`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupParams {
    /// Seconds between pings.
    pub heartbeat_interval: f64,
}

impl SetupParams {
    pub fn from_interval(interval: Duration) -> Self {
        Self {
            heartbeat_interval: interval.as_secs_f64(),
        }
    }

    /// Heartbeat period, `None` unless strictly positive and finite.
    pub fn interval(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.heartbeat_interval)
            .ok()
            .filter(|d| !d.is_zero())
    }
}

/// Parameters of `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Seconds to wait before connecting upstream.
    #[serde(default = "default_connect_wait")]
    pub wait: u64,
}

fn default_connect_wait() -> u64 {
    1
}

/// Serialize call parameters, which must form a JSON object.
///
/// `()` and `null` become an empty object.
pub fn params_object<P: Serialize>(params: P) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(params)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(serde::ser::Error::custom(format!(
            "call parameters must be an object, got {other}"
        ))),
    }
}
