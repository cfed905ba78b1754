//! Error types and status codes for Fencelock
//!
//! This module defines:
//! - `LockError`: every failure a lock operation can surface, with its diagnostic detail
//! - `LockStatus`: the flat status code reported to clients

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Client-facing status of a lock operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Ok,
    AlreadyLocked,
    NotFound,
    InvalidToken,
    Expired,
    QuorumFailed,
    Error,
    Timeout,
    NotLeader,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Ok => "OK",
            LockStatus::AlreadyLocked => "ALREADY_LOCKED",
            LockStatus::NotFound => "NOT_FOUND",
            LockStatus::InvalidToken => "INVALID_TOKEN",
            LockStatus::Expired => "EXPIRED",
            LockStatus::QuorumFailed => "QUORUM_FAILED",
            LockStatus::Error => "ERROR",
            LockStatus::Timeout => "TIMEOUT",
            LockStatus::NotLeader => "NOT_LEADER",
        }
    }
}

impl Display for LockStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(LockStatus::Ok),
            "ALREADY_LOCKED" => Ok(LockStatus::AlreadyLocked),
            "NOT_FOUND" => Ok(LockStatus::NotFound),
            "INVALID_TOKEN" => Ok(LockStatus::InvalidToken),
            "EXPIRED" => Ok(LockStatus::Expired),
            "QUORUM_FAILED" => Ok(LockStatus::QuorumFailed),
            "ERROR" => Ok(LockStatus::Error),
            "TIMEOUT" => Ok(LockStatus::Timeout),
            "NOT_LEADER" => Ok(LockStatus::NotLeader),
            _ => Err(format!("Invalid lock status: {}", s)),
        }
    }
}

/// Lock operation failures
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockError {
    #[error("lock '{lock_id}' is held by '{holder_id}' in region '{holder_region}' (token {fencing_token})")]
    AlreadyLocked {
        lock_id: String,
        holder_id: String,
        holder_region: String,
        fencing_token: u64,
    },

    #[error("lock '{0}' not found")]
    NotFound(String),

    #[error("invalid fencing token: expected {expected}, provided {provided}")]
    InvalidToken { expected: u64, provided: u64 },

    #[error("lock '{0}' has expired")]
    Expired(String),

    #[error("lock '{lock_id}' is not held by '{client_id}'")]
    NotHolder { lock_id: String, client_id: String },

    #[error("quorum failed: received {received} of {needed} votes ({reason})")]
    QuorumFailed {
        received: usize,
        needed: usize,
        reason: String,
    },

    #[error("not the leader (known leader: {})", .leader_id.as_deref().unwrap_or("unknown"))]
    NotLeader { leader_id: Option<String> },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LockError {
    /// Status code reported to clients for this error
    pub fn status(&self) -> LockStatus {
        match self {
            LockError::AlreadyLocked { .. } => LockStatus::AlreadyLocked,
            LockError::NotFound(_) => LockStatus::NotFound,
            LockError::InvalidToken { .. } => LockStatus::InvalidToken,
            LockError::Expired(_) => LockStatus::Expired,
            LockError::QuorumFailed { .. } => LockStatus::QuorumFailed,
            LockError::NotLeader { .. } => LockStatus::NotLeader,
            LockError::Timeout(_) => LockStatus::Timeout,
            LockError::NotHolder { .. } | LockError::IllegalArgument(_) | LockError::Internal(_) => {
                LockStatus::Error
            }
        }
    }

    pub fn not_leader(leader_id: Option<String>) -> Self {
        LockError::NotLeader { leader_id }
    }

    /// Known leader id when this is a `NotLeader` error
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            LockError::NotLeader { leader_id } => leader_id.as_deref(),
            _ => None,
        }
    }
}
