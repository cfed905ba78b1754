//! Authoritative in-memory lock table
//!
//! Provides:
//! - Per-key atomic acquire/release on a `DashMap` (different lock ids never contend)
//! - Token-checked release and extension
//! - Background eviction of expired locks

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fencelock_common::{LockError, current_timestamp_ms};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use super::model::{Lock, LockStats};
use super::token::FencingTokenGenerator;

#[derive(Default)]
struct LockStatsCollector {
    total_acquisitions: AtomicU64,
    total_releases: AtomicU64,
    total_extensions: AtomicU64,
    expired_locks: AtomicU64,
    failed_acquisitions: AtomicU64,
}

/// In-memory lock table
pub struct LockStore {
    region_id: String,
    locks: Arc<DashMap<String, Lock>>,
    /// Highest token ever installed per lock, kept after release and expiry
    installed_tokens: DashMap<String, u64>,
    tokens: Arc<FencingTokenGenerator>,
    stats: Arc<LockStatsCollector>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LockStore {
    pub fn new(region_id: impl Into<String>, tokens: Arc<FencingTokenGenerator>) -> Self {
        Self {
            region_id: region_id.into(),
            locks: Arc::new(DashMap::new()),
            installed_tokens: DashMap::new(),
            tokens,
            stats: Arc::new(LockStatsCollector::default()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn tokens(&self) -> &Arc<FencingTokenGenerator> {
        &self.tokens
    }

    /// Acquire a lock for a local client, issuing a fresh fencing token
    pub fn try_acquire(
        &self,
        lock_id: &str,
        holder_id: &str,
        timeout_ms: u64,
    ) -> Result<Lock, LockError> {
        let now = current_timestamp_ms();
        match self.locks.entry(lock_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired_at(now) {
                    self.stats
                        .failed_acquisitions
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(already_locked(entry.get()));
                }
                let lock = self.new_local_lock(lock_id, holder_id, now, timeout_ms);
                entry.insert(lock.clone());
                self.stats
                    .total_acquisitions
                    .fetch_add(1, Ordering::Relaxed);
                Ok(lock)
            }
            Entry::Vacant(entry) => {
                let lock = self.new_local_lock(lock_id, holder_id, now, timeout_ms);
                entry.insert(lock.clone());
                self.stats
                    .total_acquisitions
                    .fetch_add(1, Ordering::Relaxed);
                Ok(lock)
            }
        }
    }

    fn new_local_lock(&self, lock_id: &str, holder_id: &str, now: i64, timeout_ms: u64) -> Lock {
        let token = self.tokens.next_token(lock_id);
        self.record_installed(lock_id, token);
        Lock::new(
            lock_id,
            holder_id,
            self.region_id.clone(),
            token,
            now,
            now + timeout_ms as i64,
        )
    }

    /// Install a lock whose token was issued elsewhere (a committed command or a peer region)
    ///
    /// Re-applying the same holder and token over a live record refreshes its
    /// expiry. Any other acquisition must carry a token above every token
    /// this store has installed for `lock_id`, released or not.
    pub fn acquire_with_token(
        &self,
        lock_id: &str,
        holder_id: &str,
        holder_region: &str,
        fencing_token: u64,
        acquired_at: i64,
        expires_at: i64,
    ) -> Result<Lock, LockError> {
        let now = current_timestamp_ms();
        let lock = Lock::new(
            lock_id,
            holder_id,
            holder_region,
            fencing_token,
            acquired_at,
            expires_at,
        );

        match self.locks.entry(lock_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.fencing_token == fencing_token
                    && current.holder_id == holder_id
                    && !current.is_expired_at(now)
                {
                    entry.insert(lock.clone());
                    return Ok(lock);
                }
                if !current.is_expired_at(now) {
                    self.stats
                        .failed_acquisitions
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(already_locked(current));
                }
                self.check_fresh_token(lock_id, fencing_token)?;
                entry.insert(lock.clone());
            }
            Entry::Vacant(entry) => {
                self.check_fresh_token(lock_id, fencing_token)?;
                entry.insert(lock.clone());
            }
        }

        self.record_installed(lock_id, fencing_token);
        self.tokens.observe(lock_id, fencing_token);
        self.stats
            .total_acquisitions
            .fetch_add(1, Ordering::Relaxed);
        Ok(lock)
    }

    /// Highest token installed for `lock_id` (0 when none)
    pub fn installed_token(&self, lock_id: &str) -> u64 {
        self.installed_tokens.get(lock_id).map(|t| *t).unwrap_or(0)
    }

    fn check_fresh_token(&self, lock_id: &str, fencing_token: u64) -> Result<(), LockError> {
        let installed = self.installed_token(lock_id);
        if fencing_token <= installed {
            self.stats
                .failed_acquisitions
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                lock_id = %lock_id,
                token = fencing_token,
                installed,
                "Rejected stale fencing token"
            );
            return Err(LockError::InvalidToken {
                expected: installed + 1,
                provided: fencing_token,
            });
        }
        Ok(())
    }

    fn record_installed(&self, lock_id: &str, fencing_token: u64) {
        let mut installed = self.installed_tokens.entry(lock_id.to_string()).or_insert(0);
        if fencing_token > *installed {
            *installed = fencing_token;
        }
    }

    /// Release a lock held by `holder_id`
    pub fn release(&self, lock_id: &str, holder_id: &str) -> Result<Lock, LockError> {
        self.remove_checked(lock_id, |lock| {
            if lock.holder_id != holder_id {
                return Err(LockError::NotHolder {
                    lock_id: lock_id.to_string(),
                    client_id: holder_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Release a lock if `fencing_token` matches the live record
    pub fn release_by_token(&self, lock_id: &str, fencing_token: u64) -> Result<Lock, LockError> {
        self.remove_checked(lock_id, |lock| check_token(lock, fencing_token))
    }

    fn remove_checked<F>(&self, lock_id: &str, check: F) -> Result<Lock, LockError>
    where
        F: FnOnce(&Lock) -> Result<(), LockError>,
    {
        match self.locks.entry(lock_id.to_string()) {
            Entry::Vacant(_) => Err(LockError::NotFound(lock_id.to_string())),
            Entry::Occupied(entry) => {
                if entry.get().is_expired() {
                    entry.remove();
                    self.stats.expired_locks.fetch_add(1, Ordering::Relaxed);
                    return Err(LockError::Expired(lock_id.to_string()));
                }
                check(entry.get())?;
                let lock = entry.remove();
                self.stats.total_releases.fetch_add(1, Ordering::Relaxed);
                debug!(lock_id = %lock_id, token = lock.fencing_token, "Lock released");
                Ok(lock)
            }
        }
    }

    /// Move the expiry of a live lock, keeping its token
    pub fn extend(
        &self,
        lock_id: &str,
        fencing_token: u64,
        expires_at: i64,
    ) -> Result<Lock, LockError> {
        match self.locks.get_mut(lock_id) {
            None => Err(LockError::NotFound(lock_id.to_string())),
            Some(mut entry) => {
                if entry.is_expired() {
                    return Err(LockError::Expired(lock_id.to_string()));
                }
                check_token(&entry, fencing_token)?;
                let extended = entry.with_expires_at(expires_at);
                *entry = extended.clone();
                self.stats.total_extensions.fetch_add(1, Ordering::Relaxed);
                Ok(extended)
            }
        }
    }

    /// Verify that `holder_id` holds `lock_id` under `fencing_token`
    pub fn check_holder(
        &self,
        lock_id: &str,
        holder_id: &str,
        fencing_token: u64,
    ) -> Result<Lock, LockError> {
        let lock = self
            .locks
            .get(lock_id)
            .map(|l| l.clone())
            .ok_or_else(|| LockError::NotFound(lock_id.to_string()))?;
        if lock.is_expired() {
            return Err(LockError::Expired(lock_id.to_string()));
        }
        if lock.holder_id != holder_id {
            return Err(LockError::NotHolder {
                lock_id: lock_id.to_string(),
                client_id: holder_id.to_string(),
            });
        }
        check_token(&lock, fencing_token)?;
        Ok(lock)
    }

    /// Live lock for `lock_id`, if any
    pub fn get_lock(&self, lock_id: &str) -> Option<Lock> {
        self.locks
            .get(lock_id)
            .filter(|l| !l.is_expired())
            .map(|l| l.clone())
    }

    /// All unexpired locks, regardless of sweep timing
    pub fn get_all_active_locks(&self) -> Vec<Lock> {
        let now = current_timestamp_ms();
        self.locks
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Evict expired locks, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        Self::sweep(&self.locks, &self.stats)
    }

    fn sweep(locks: &DashMap<String, Lock>, stats: &LockStatsCollector) -> usize {
        let now = current_timestamp_ms();
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_expired_at(now));
        let removed = before.saturating_sub(locks.len());
        if removed > 0 {
            stats
                .expired_locks
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(count = removed, "Cleaned up expired lock entries");
        }
        metrics::gauge!("fencelock_active_locks").set(locks.len() as f64);
        removed
    }

    /// Start the background expiry sweep
    pub fn start_sweeper(&self, sweep_interval: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let locks = self.locks.clone();
        let stats = self.stats.clone();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = interval(sweep_interval);
            loop {
                interval.tick().await;
                Self::sweep(&locks, &stats);
            }
        }));

        info!(
            region = %self.region_id,
            interval_ms = sweep_interval.as_millis() as u64,
            "Lock store expiry sweep started"
        );
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            active_locks: self.get_all_active_locks().len() as u64,
            total_acquisitions: self.stats.total_acquisitions.load(Ordering::Relaxed),
            total_releases: self.stats.total_releases.load(Ordering::Relaxed),
            total_extensions: self.stats.total_extensions.load(Ordering::Relaxed),
            expired_locks: self.stats.expired_locks.load(Ordering::Relaxed),
            failed_acquisitions: self.stats.failed_acquisitions.load(Ordering::Relaxed),
        }
    }
}

impl Drop for LockStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

fn already_locked(lock: &Lock) -> LockError {
    LockError::AlreadyLocked {
        lock_id: lock.lock_id.clone(),
        holder_id: lock.holder_id.clone(),
        holder_region: lock.holder_region.clone(),
        fencing_token: lock.fencing_token,
    }
}

fn check_token(lock: &Lock, provided: u64) -> Result<(), LockError> {
    if lock.fencing_token != provided {
        return Err(LockError::InvalidToken {
            expected: lock.fencing_token,
            provided,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LockStore {
        LockStore::new("us-east", Arc::new(FencingTokenGenerator::new()))
    }

    #[test]
    fn test_acquire_release_cycle() {
        let store = store();

        let lock = store.try_acquire("L1", "c1", 5000).unwrap();
        assert_eq!(lock.fencing_token, 1);
        assert_eq!(lock.holder_region, "us-east");

        match store.try_acquire("L1", "c2", 5000) {
            Err(LockError::AlreadyLocked {
                holder_id,
                fencing_token,
                ..
            }) => {
                assert_eq!(holder_id, "c1");
                assert_eq!(fencing_token, 1);
            }
            other => panic!("expected AlreadyLocked, got {:?}", other),
        }

        store.release("L1", "c1").unwrap();
        let lock = store.try_acquire("L1", "c2", 5000).unwrap();
        assert_eq!(lock.fencing_token, 2);
    }

    #[test]
    fn test_release_errors() {
        let store = store();
        assert!(matches!(
            store.release("missing", "c1"),
            Err(LockError::NotFound(_))
        ));

        store.try_acquire("L1", "c1", 5000).unwrap();
        assert!(matches!(
            store.release("L1", "c2"),
            Err(LockError::NotHolder { .. })
        ));
        assert_eq!(
            store.release_by_token("L1", 7),
            Err(LockError::InvalidToken {
                expected: 1,
                provided: 7
            })
        );
        assert!(store.release_by_token("L1", 1).is_ok());
        assert!(store.get_lock("L1").is_none());
    }

    #[test]
    fn test_expired_lock_is_replaceable_and_reported() {
        let store = store();
        let now = current_timestamp_ms();
        store
            .acquire_with_token("L1", "c1", "eu", 4, now - 2000, now - 1000)
            .unwrap();

        assert!(store.get_lock("L1").is_none());
        assert!(store.get_all_active_locks().is_empty());
        assert!(matches!(
            store.release_by_token("L1", 4),
            Err(LockError::Expired(_))
        ));

        store
            .acquire_with_token("L1", "c1", "eu", 5, now - 2000, now - 1000)
            .unwrap();
        let lock = store.try_acquire("L1", "c2", 1000).unwrap();
        assert_eq!(lock.fencing_token, 6);
    }

    #[test]
    fn test_acquire_with_token_refresh_and_conflict() {
        let store = store();
        let now = current_timestamp_ms();

        store
            .acquire_with_token("L1", "c1", "eu", 3, now, now + 5000)
            .unwrap();
        let refreshed = store
            .acquire_with_token("L1", "c1", "eu", 3, now, now + 9000)
            .unwrap();
        assert_eq!(refreshed.expires_at, now + 9000);

        let err = store
            .acquire_with_token("L1", "c2", "us", 4, now, now + 5000)
            .unwrap_err();
        assert_eq!(err.status(), fencelock_common::LockStatus::AlreadyLocked);
        assert_eq!(store.tokens().current_token("L1"), 3);
    }

    #[test]
    fn test_stale_token_rejected_over_expired_record() {
        let store = store();
        let now = current_timestamp_ms();
        store
            .acquire_with_token("L1", "c1", "eu", 9, now - 2000, now - 1000)
            .unwrap();
        assert!(matches!(
            store.acquire_with_token("L1", "c2", "eu", 8, now, now + 1000),
            Err(LockError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_released_token_never_reinstalled() {
        let store = store();
        let now = current_timestamp_ms();
        store
            .acquire_with_token("L1", "c1", "eu", 3, now, now + 5000)
            .unwrap();
        store.release_by_token("L1", 3).unwrap();

        assert_eq!(
            store.acquire_with_token("L1", "c2", "us", 3, now, now + 5000),
            Err(LockError::InvalidToken {
                expected: 4,
                provided: 3
            })
        );
        assert_eq!(
            store.acquire_with_token("L1", "c2", "us", 1, now, now + 5000),
            Err(LockError::InvalidToken {
                expected: 4,
                provided: 1
            })
        );
        assert!(store.get_lock("L1").is_none());

        let lock = store
            .acquire_with_token("L1", "c2", "us", 4, now, now + 5000)
            .unwrap();
        assert_eq!(lock.fencing_token, 4);
        assert_eq!(store.installed_token("L1"), 4);
    }

    #[test]
    fn test_local_acquisitions_raise_installed_token() {
        let store = store();
        let lock = store.try_acquire("L1", "c1", 5000).unwrap();
        store.release("L1", "c1").unwrap();
        assert_eq!(store.installed_token("L1"), lock.fencing_token);

        let now = current_timestamp_ms();
        assert!(matches!(
            store.acquire_with_token("L1", "c2", "eu", lock.fencing_token, now, now + 5000),
            Err(LockError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_extend_keeps_token() {
        let store = store();
        let lock = store.try_acquire("L1", "c1", 1000).unwrap();
        let extended = store
            .extend("L1", lock.fencing_token, lock.expires_at + 10_000)
            .unwrap();
        assert_eq!(extended.fencing_token, lock.fencing_token);
        assert_eq!(extended.expires_at, lock.expires_at + 10_000);
        assert!(matches!(
            store.extend("L1", 99, lock.expires_at),
            Err(LockError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_check_holder() {
        let store = store();
        store.try_acquire("L1", "c1", 5000).unwrap();
        assert!(store.check_holder("L1", "c1", 1).is_ok());
        assert!(matches!(
            store.check_holder("L1", "c2", 1),
            Err(LockError::NotHolder { .. })
        ));
        assert!(matches!(
            store.check_holder("L1", "c1", 2),
            Err(LockError::InvalidToken { .. })
        ));
        assert!(matches!(
            store.check_holder("L2", "c1", 1),
            Err(LockError::NotFound(_))
        ));
    }

    #[test]
    fn test_sweep_and_stats() {
        let store = store();
        let now = current_timestamp_ms();
        store.try_acquire("live", "c1", 60_000).unwrap();
        store
            .acquire_with_token("dead", "c1", "eu", 1, now - 2000, now - 1)
            .unwrap();

        assert_eq!(store.sweep_expired(), 1);
        let stats = store.stats();
        assert_eq!(stats.active_locks, 1);
        assert_eq!(stats.total_acquisitions, 2);
        assert_eq!(stats.expired_locks, 1);
    }

    #[tokio::test]
    async fn test_background_sweeper_evicts() {
        let store = store();
        store.try_acquire("short", "c1", 20).unwrap();
        store.start_sweeper(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.locks.len(), 0);
        store.stop_sweeper();
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.try_acquire("hot", &format!("c{}", i), 60_000))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(winners, 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_installed_tokens_strictly_increase(
            ops in proptest::collection::vec((1u64..20, proptest::bool::ANY), 0..40)
        ) {
            let store = store();
            let mut last = 0;
            for (i, (token, release)) in ops.into_iter().enumerate() {
                let now = current_timestamp_ms();
                let holder = format!("c{}", i);
                let acquired =
                    store.acquire_with_token("L1", &holder, "eu", token, now, now + 60_000);
                if let Ok(lock) = acquired {
                    proptest::prop_assert!(lock.fencing_token > last);
                    last = lock.fencing_token;
                }
                if release {
                    let _ = store.release_by_token("L1", token);
                }
                proptest::prop_assert_eq!(store.installed_token("L1"), last);
            }
        }
    }
}
