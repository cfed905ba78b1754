//! Fencelock Consistency - Raft consensus and the lock state it drives
//!
//! This crate provides:
//! - Raft implementation (election, replication, commit tracking)
//! - In-memory Raft log and lock state machine
//! - Lock store with expiry and per-lock fencing tokens
//! - Transport seam with an in-process network for tests and local clusters

#![allow(clippy::result_large_err)]

pub mod lock;
pub mod raft;

// Re-export commonly used types
pub use raft::types::*;

// Re-export Raft node and config
pub use raft::config::RaftConfig;
pub use raft::node::{CommitHandle, RaftNode};
pub use raft::state_machine::RaftStateMachine;

// Re-export lock types
pub use lock::{FencingTokenGenerator, Lock, LockStats, LockStore};
