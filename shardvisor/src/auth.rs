//! Shard authentication against the fleet's shared secret.

use sha2::{Digest, Sha512};

use crate::bridge::protocol::{Identify, ShardIndex};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed for shard {shard}")]
    AuthenticationFailure { shard: ShardIndex },

    #[error("shard index {shard} out of range for {total} shards")]
    IndexOutOfRange { shard: ShardIndex, total: usize },
}

impl AuthError {
    pub fn shard(&self) -> ShardIndex {
        match self {
            Self::AuthenticationFailure { shard } | Self::IndexOutOfRange { shard, .. } => *shard,
        }
    }
}

/// Lowercase hex SHA-512 of the secret followed by the decimal shard index.
pub fn password_hash(secret: &str, shard: ShardIndex) -> String {
    let digest = Sha512::digest(format!("{secret}{shard}").as_bytes());
    hex::encode(digest)
}

/// The handshake a shard should send.
pub fn identify(secret: &str, shard: ShardIndex) -> Identify {
    Identify {
        shard_index: shard,
        password_hash: password_hash(secret, shard),
    }
}

/// Check a handshake against the secret and the fleet size.
pub fn verify(identify: &Identify, secret: &str, total_shards: usize) -> Result<(), AuthError> {
    let shard = identify.shard_index;
    if shard >= total_shards {
        return Err(AuthError::IndexOutOfRange {
            shard,
            total: total_shards,
        });
    }
    if identify.password_hash.as_bytes() != password_hash(secret, shard).as_bytes() {
        return Err(AuthError::AuthenticationFailure { shard });
    }
    Ok(())
}
