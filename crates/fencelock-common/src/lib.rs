//! Fencelock Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Fencelock components:
//! - The lock error taxonomy and client-facing status codes
//! - Timestamp helpers
//! - Lock id validation

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{LockError, LockStatus};
pub use utils::{current_timestamp_ms, is_valid_lock_id, validate_lock_id};

/// Region id used when none is configured
pub const DEFAULT_REGION: &str = "default";

/// Maximum length of a lock id
pub const MAX_LOCK_ID_LENGTH: usize = 256;
