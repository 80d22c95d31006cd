//! Operator console commands, read line by line from stdin by the master binary and
//! by each shard binary.

use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

use tokio::sync::mpsc;

use crate::bridge::protocol::ShardIndex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    #[error("unknown command: {0:?}")]
    Unknown(String),

    #[error("invalid shard index {0:?}")]
    InvalidShard(String),

    #[error("shard {shard} out of range for {total} shards")]
    ShardOutOfRange { shard: ShardIndex, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Shut the fleet down and exit once every shard is gone.
    Quit,
    /// `die` to every shard; they are relaunched.
    KillAll,
    KillShard(ShardIndex),
    /// Connect the whole fleet with staggered waits.
    ConnectAll,
    ConnectShard(ShardIndex),
    /// Launch every shard process.
    Start,
    /// Log a snapshot of the fleet.
    Stats,
}

impl ConsoleCommand {
    /// Parse one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            [] => return Ok(None),
            ["quit"] => Self::Quit,
            ["kill", "all"] => Self::KillAll,
            ["kill", "shard", n] => Self::KillShard(parse_index(n)?),
            ["connect"] => Self::ConnectAll,
            ["connect", "shard", n] => Self::ConnectShard(parse_index(n)?),
            ["start"] => Self::Start,
            ["stats"] => Self::Stats,
            _ => return Err(ConsoleError::Unknown(line.trim().to_string())),
        };
        Ok(Some(command))
    }

    /// Reject shard indices outside the fleet.
    pub fn check_range(self, total_shards: usize) -> Result<Self, ConsoleError> {
        match self {
            Self::KillShard(shard) | Self::ConnectShard(shard) if shard >= total_shards => {
                Err(ConsoleError::ShardOutOfRange {
                    shard,
                    total: total_shards,
                })
            }
            other => Ok(other),
        }
    }
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)?.ok_or_else(|| ConsoleError::Unknown(String::new()))
    }
}

impl fmt::Display for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quit => f.write_str("quit"),
            Self::KillAll => f.write_str("kill all"),
            Self::KillShard(n) => write!(f, "kill shard {n}"),
            Self::ConnectAll => f.write_str("connect"),
            Self::ConnectShard(n) => write!(f, "connect shard {n}"),
            Self::Start => f.write_str("start"),
            Self::Stats => f.write_str("stats"),
        }
    }
}

/// Commands a shard binary accepts on its own stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardCommand {
    /// Disconnect the gateway and exit.
    Die,
    /// Connect the gateway without waiting for the master.
    Jumpstart,
    /// Try to reattach to the master now.
    TryUnorphan,
}

impl ShardCommand {
    /// Parse one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            [] => return Ok(None),
            ["die"] => Self::Die,
            ["jumpstart"] => Self::Jumpstart,
            ["tryunorphan"] => Self::TryUnorphan,
            _ => return Err(ConsoleError::Unknown(line.trim().to_string())),
        };
        Ok(Some(command))
    }
}

impl fmt::Display for ShardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Die => f.write_str("die"),
            Self::Jumpstart => f.write_str("jumpstart"),
            Self::TryUnorphan => f.write_str("tryunorphan"),
        }
    }
}

/// Lines from stdin, read on a dedicated thread so a pending read never holds up
/// runtime shutdown. The receiver closes at EOF.
pub fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read console");
                    break;
                }
            }
        }
    });
    rx
}

fn parse_index(word: &str) -> Result<ShardIndex, ConsoleError> {
    word.parse()
        .map_err(|_| ConsoleError::InvalidShard(word.to_string()))
}
