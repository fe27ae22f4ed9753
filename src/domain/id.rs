//! Identifiers for remote entities and local mutations
//!
//! ID Format:
//! - Remote IDs: whatever the service assigns (opaque, non-empty)
//! - Temporary IDs: `tmp-{7-char-hash}` for entities created locally and not yet pushed
//! - Mutation tokens: 32 hex chars, sent with every push so the remote can deduplicate
//!
//! Hashes are derived with BLAKE3 from a seed plus a timestamp, so the same
//! seed at different times produces different IDs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("Entity ID must not be empty")]
    Empty,

    #[error("Invalid mutation token: expected 32 hex chars, got '{0}'")]
    InvalidToken(String),
}

const TEMP_PREFIX: &str = "tmp-";

/// Generates a hex hash of the given length from a seed and timestamp
fn generate_hash(seed: &str, timestamp: DateTime<Utc>, len: usize) -> String {
    let input = format!("{}{}", seed, timestamp.timestamp_nanos_opt().unwrap_or(0));
    let hash = blake3::hash(input.as_bytes());
    let hex = hash.to_hex();
    hex[..len].to_string()
}

/// Stable identifier of a remote entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Creates a temporary ID for an entity created locally
    pub fn temporary(seed: &str, timestamp: DateTime<Utc>) -> Self {
        Self(format!("{}{}", TEMP_PREFIX, generate_hash(seed, timestamp, 7)))
    }

    /// Returns true if the remote has not assigned this entity a permanent ID yet
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for EntityId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Idempotency token attached to a pushed mutation
///
/// Generated once when the mutation is queued and stored with it, so every
/// retry of the same mutation carries the same token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MutationToken(String);

impl MutationToken {
    /// Derives a token from the mutation's identity and queue time
    pub fn new(entity_id: &EntityId, op: &str, seq: u64, timestamp: DateTime<Utc>) -> Self {
        let seed = format!("{}:{}:{}", entity_id, op, seq);
        Self(generate_hash(&seed, timestamp, 32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MutationToken {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdError::InvalidToken(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for MutationToken {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MutationToken> for String {
    fn from(token: MutationToken) -> Self {
        token.0
    }
}
