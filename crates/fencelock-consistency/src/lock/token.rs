//! Per-lock fencing token counters

use dashmap::DashMap;

/// Issues strictly increasing fencing tokens per lock id
///
/// Followers never issue tokens but call [`observe`](Self::observe) for every
/// token they apply, so a newly elected leader continues above everything
/// already committed.
#[derive(Debug, Default)]
pub struct FencingTokenGenerator {
    counters: DashMap<String, u64>,
}

impl FencingTokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next token for `lock_id`, starting at 1
    pub fn next_token(&self, lock_id: &str) -> u64 {
        let mut counter = self.counters.entry(lock_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Highest token issued or observed for `lock_id` (0 when none)
    pub fn current_token(&self, lock_id: &str) -> u64 {
        self.counters.get(lock_id).map(|c| *c).unwrap_or(0)
    }

    /// Raise the counter to at least `token`
    pub fn observe(&self, lock_id: &str, token: u64) {
        let mut counter = self.counters.entry(lock_id.to_string()).or_insert(0);
        if token > *counter {
            *counter = token;
        }
    }
}
