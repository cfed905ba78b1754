// Services of a lock node

pub mod circuit_breaker;
pub mod forwarder;
pub mod lock;
pub mod quorum;
pub mod region_client;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use forwarder::{LeaderForwarder, LockClient};
pub use lock::LockService;
pub use quorum::{PENDING_VOTE_FOR_ANOTHER_REGION, PendingVote, QuorumDecision, QuorumManager};
pub use region_client::{CrossRegionClient, RegionClientManager};
