//! Per-business rule cache with an explicit expiry contract.
//!
//! Entries carry the rule-set version they were built from; writes replace
//! the whole entry, so readers never observe a mix of old and new rules.
//! The clock is a seam so expiry is testable without wall-clock sleeps.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::content::BusinessId;
use crate::domain::rule::BusinessRule;

pub const DEFAULT_RULE_TTL_SECS: i64 = 300;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    rules: Arc<Vec<BusinessRule>>,
    version: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<BusinessId, CacheEntry>,
    write_epochs: HashMap<BusinessId, u64>,
}

pub struct RuleCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl RuleCache {
    pub fn new(ttl_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self { ttl: Duration::seconds(ttl_secs), clock, state: RwLock::new(CacheState::default()) }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_RULE_TTL_SECS, Arc::new(SystemClock))
    }

    /// Fresh entry or nothing. Expired entries are treated as absent and
    /// swept lazily on the next store.
    pub fn get(&self, business_id: &BusinessId) -> Option<Arc<Vec<BusinessRule>>> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = state.entries.get(business_id)?;
        if entry.expires_at <= self.clock.now() {
            return None;
        }
        Some(Arc::clone(&entry.rules))
    }

    /// The business's current write epoch. A filler captures it before
    /// reading the rule set and hands it back to [`RuleCache::store`].
    pub fn epoch(&self, business_id: &BusinessId) -> u64 {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.write_epochs.get(business_id).copied().unwrap_or(0)
    }

    /// Stores a freshly fetched rule set. `version` is the highest rule
    /// version in the set; `epoch` is the write epoch observed before the
    /// set was read. A fill whose epoch is behind the current one read a
    /// pre-write rule set and is discarded.
    pub fn store(
        &self,
        business_id: BusinessId,
        rules: Vec<BusinessRule>,
        version: u64,
        epoch: u64,
    ) {
        let now = self.clock.now();
        let entry =
            CacheEntry { rules: Arc::new(rules), version, expires_at: now + self.ttl };

        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.write_epochs.get(&business_id).copied().unwrap_or(0) != epoch {
            return;
        }
        match state.entries.get(&business_id) {
            Some(existing) if existing.version > version && existing.expires_at > now => {}
            _ => {
                state.entries.insert(business_id, entry);
            }
        }
    }

    /// Called on every rule write for the business. Bumps the write epoch
    /// so in-flight fills started before the write cannot land.
    pub fn invalidate(&self, business_id: &BusinessId) {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.entries.remove(business_id);
        *state.write_epochs.entry(business_id.clone()).or_insert(0) += 1;
    }
}
