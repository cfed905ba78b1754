//! Utility functions for Fencelock
//!
//! Common helper functions used across the codebase.

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::MAX_LOCK_ID_LENGTH;
use crate::error::LockError;

/// Regex pattern for validating lock ids
static LOCK_ID_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_./:-]+$").expect("Invalid regex pattern"));

/// Current wall-clock time in Unix milliseconds
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Check a lock id against the allowed format
///
/// Allowed characters: alphanumeric, underscore, dot, slash, colon, hyphen.
///
/// # Examples
///
/// ```
/// use fencelock_common::is_valid_lock_id;
///
/// assert!(is_valid_lock_id("orders/42"));
/// assert!(is_valid_lock_id("job:nightly-report"));
/// assert!(!is_valid_lock_id(""));
/// assert!(!is_valid_lock_id("with spaces"));
/// ```
pub fn is_valid_lock_id(lock_id: &str) -> bool {
    lock_id.len() <= MAX_LOCK_ID_LENGTH && LOCK_ID_PATTERN.is_match(lock_id)
}

/// Validate a lock id, returning an `IllegalArgument` error when it is malformed
pub fn validate_lock_id(lock_id: &str) -> Result<(), LockError> {
    if lock_id.is_empty() {
        return Err(LockError::IllegalArgument("lockId must not be empty".to_string()));
    }
    if !is_valid_lock_id(lock_id) {
        return Err(LockError::IllegalArgument(format!(
            "invalid lockId '{}'",
            lock_id
        )));
    }
    Ok(())
}
