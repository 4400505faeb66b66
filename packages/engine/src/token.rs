//! Session tokens for read-your-writes probing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The `(peer, seq)` pair returned from an upsert.
///
/// Clients hand the token to any replica's `is_consistent` to learn
/// whether that replica has caught up to the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken {
    /// Peer that accepted the write.
    pub peer: i64,
    /// Sequence number the write received at that peer.
    pub seq: i64,
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer, self.seq)
    }
}

/// Error parsing a session token from its `"peer.seq"` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed session token: {0:?}")]
pub struct ParseTokenError(pub String);

impl FromStr for SessionToken {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer, seq) = s
            .split_once('.')
            .ok_or_else(|| ParseTokenError(s.to_string()))?;
        let peer = peer
            .parse::<i64>()
            .map_err(|_| ParseTokenError(s.to_string()))?;
        let seq = seq
            .parse::<i64>()
            .map_err(|_| ParseTokenError(s.to_string()))?;
        Ok(Self { peer, seq })
    }
}
