//! Lock data model

use fencelock_common::current_timestamp_ms;
use serde::{Deserialize, Serialize};

/// A held lock
///
/// Records are immutable once created: a new acquisition or an extension
/// produces a new record that replaces the old one in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Lock name
    pub lock_id: String,
    /// Client that holds the lock
    pub holder_id: String,
    /// Region the holder acquired the lock through
    pub holder_region: String,
    /// Fencing token issued for this acquisition
    pub fencing_token: u64,
    /// Acquisition timestamp (Unix millis)
    pub acquired_at: i64,
    /// Expiration timestamp (Unix millis)
    pub expires_at: i64,
}

impl Lock {
    pub fn new(
        lock_id: impl Into<String>,
        holder_id: impl Into<String>,
        holder_region: impl Into<String>,
        fencing_token: u64,
        acquired_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            lock_id: lock_id.into(),
            holder_id: holder_id.into(),
            holder_region: holder_region.into(),
            fencing_token,
            acquired_at,
            expires_at,
        }
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Check if the given client holds this lock
    pub fn is_held_by(&self, holder_id: &str) -> bool {
        !self.is_expired() && self.holder_id == holder_id
    }

    /// Calculate remaining TTL in milliseconds
    pub fn remaining_ttl_ms(&self) -> u64 {
        let now = current_timestamp_ms();
        if self.expires_at > now {
            (self.expires_at - now) as u64
        } else {
            0
        }
    }

    /// Copy of this record with a new expiration
    pub fn with_expires_at(&self, expires_at: i64) -> Self {
        Self {
            expires_at,
            ..self.clone()
        }
    }
}

/// Lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Currently held locks
    pub active_locks: u64,
    /// Total acquisitions
    pub total_acquisitions: u64,
    /// Total releases
    pub total_releases: u64,
    /// Total extensions
    pub total_extensions: u64,
    /// Locks evicted after expiring
    pub expired_locks: u64,
    /// Failed acquisitions (lock contention)
    pub failed_acquisitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_expiring_at(expires_at: i64) -> Lock {
        Lock::new("L1", "c1", "us-east", 1, expires_at - 1000, expires_at)
    }

    #[test]
    fn test_expiration() {
        let now = current_timestamp_ms();
        let live = lock_expiring_at(now + 10_000);
        assert!(!live.is_expired());
        assert!(live.is_held_by("c1"));
        assert!(!live.is_held_by("c2"));
        assert!(live.remaining_ttl_ms() > 0);

        let dead = lock_expiring_at(now - 1);
        assert!(dead.is_expired());
        assert!(!dead.is_held_by("c1"));
        assert_eq!(dead.remaining_ttl_ms(), 0);
    }

    #[test]
    fn test_is_expired_at_boundary() {
        let lock = lock_expiring_at(5_000);
        assert!(!lock.is_expired_at(4_999));
        assert!(lock.is_expired_at(5_000));
    }

    #[test]
    fn test_with_expires_at_keeps_identity() {
        let lock = lock_expiring_at(5_000);
        let extended = lock.with_expires_at(9_000);
        assert_eq!(extended.fencing_token, lock.fencing_token);
        assert_eq!(extended.holder_id, lock.holder_id);
        assert_eq!(extended.acquired_at, lock.acquired_at);
        assert_eq!(extended.expires_at, 9_000);
        assert_eq!(lock.expires_at, 5_000);
    }
}
