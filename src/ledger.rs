//! Execution ledger — the at-most-once firing guarantee.
//!
//! Every confirmed trigger is recorded under its composite key (schedule,
//! clip, trigger epoch bucket). `try_claim` is the single correctness-critical
//! primitive of the subsystem: an atomic check-and-set under one mutex, so
//! concurrent evaluators, retried requests, and overlapping ticks collapse
//! onto one winner per key. Records are never mutated; old ones are pruned
//! once their trigger epoch can no longer recur.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// How long claim records are kept before pruning (seconds).
pub const LEDGER_RETENTION_SECS: i64 = 24 * 3600;

/// Composite key identifying one trigger of one schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimKey {
    pub schedule: u32,
    pub clip: String,
    pub epoch: i64,
}

impl ClaimKey {
    pub fn new(schedule: u32, clip: &str, epoch: i64) -> Self {
        ClaimKey {
            schedule,
            clip: clip.to_string(),
            epoch,
        }
    }
}

/// Round a unix timestamp down to the given granularity, so near-simultaneous
/// firing attempts share one claim key.
pub fn bucket_epoch(timestamp: i64, granularity_secs: i64) -> i64 {
    if granularity_secs <= 0 {
        return timestamp;
    }
    timestamp.div_euclid(granularity_secs) * granularity_secs
}

/// Thread-safe claim store. Values record when the claim was taken, for
/// retention pruning.
pub struct ExecutionLedger {
    claims: Mutex<HashMap<ClaimKey, i64>>,
    retention_secs: i64,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        ExecutionLedger {
            claims: Mutex::new(HashMap::new()),
            retention_secs: LEDGER_RETENTION_SECS,
        }
    }

    pub fn with_retention(retention_secs: i64) -> Self {
        ExecutionLedger {
            claims: Mutex::new(HashMap::new()),
            retention_secs,
        }
    }

    /// Atomically claim a trigger. Returns true exactly once per key;
    /// duplicates return false with no side effect.
    pub fn try_claim(&self, key: ClaimKey, now: NaiveDateTime) -> bool {
        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(&key) {
            return false;
        }
        claims.insert(key, now.and_utc().timestamp());
        true
    }

    /// Whether a claim already exists for the key.
    pub fn is_claimed(&self, key: &ClaimKey) -> bool {
        self.claims.lock().unwrap().contains_key(key)
    }

    /// Drop records older than the retention window. Returns how many were
    /// removed.
    pub fn prune(&self, now: NaiveDateTime) -> usize {
        let cutoff = now.and_utc().timestamp() - self.retention_secs;
        let mut claims = self.claims.lock().unwrap();
        let before = claims.len();
        claims.retain(|_, claimed_at| *claimed_at > cutoff);
        before - claims.len()
    }

    pub fn len(&self) -> usize {
        self.claims.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.lock().unwrap().is_empty()
    }

    /// Snapshot all records for persistence.
    pub fn export(&self) -> Vec<(ClaimKey, i64)> {
        self.claims
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Restore records from a persisted snapshot. Existing claims win.
    pub fn import(&self, records: Vec<(ClaimKey, i64)>) {
        let mut claims = self.claims.lock().unwrap();
        for (key, claimed_at) in records {
            claims.entry(key).or_insert(claimed_at);
        }
    }
}

impl Default for ExecutionLedger {
    fn default() -> Self {
        Self::new()
    }
}
