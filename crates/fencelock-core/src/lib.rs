//! Fencelock Core - lock service, cross-region quorum and region clients
//!
//! This crate provides:
//! - Lock service orchestrating validation, quorum and Raft commits
//! - Cross-region vote coordination with provisional reservations
//! - Region clients with deadlines, retries and circuit breakers
//! - Leader forwarding for client requests
//! - The `LockNode` facade and an in-process transport for local clusters

#![allow(clippy::result_large_err)]

pub mod metrics;
pub mod model;
pub mod node;
pub mod service;
pub mod transport;

pub use model::{
    LockConfig, LockRequest, LockResponse, LockVoteRequest, LockVoteResponse, NodeConfig,
    PingResponse, QuorumConfig, RegionClientConfig, SyncLockStateResponse,
};
pub use node::LockNode;
pub use service::{
    CrossRegionClient, LeaderForwarder, LockClient, LockService, QuorumManager,
    RegionClientManager,
};
