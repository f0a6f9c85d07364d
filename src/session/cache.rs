//! In-process session cache
//!
//! Verified sessions are cached for a short TTL so the hot path can skip
//! re-verification. Entries past the TTL are not returned as hits but stay
//! consultable as stale state: the validator still needs the recorded
//! `last_activity` to run the inactivity check before re-verifying.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use crate::models::SessionData;

struct CacheEntry {
    session: SessionData,
    cached_at: DateTime<Utc>,
}

/// TTL-bounded cache of verified sessions, keyed by session id
pub struct SessionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl SessionCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Fresh hit: entry exists and is inside the TTL
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionData> {
        let entries = self.entries.read().ok()?;
        entries
            .get(session_id)
            .filter(|e| Utc::now() - e.cached_at < self.ttl)
            .map(|e| e.session.clone())
    }

    /// Stale-tolerant read: returns the entry regardless of TTL
    ///
    /// Used for the inactivity check after a TTL miss, where the stale
    /// `last_activity` is still the best available record.
    #[must_use]
    pub fn get_stale(&self, session_id: &str) -> Option<SessionData> {
        let entries = self.entries.read().ok()?;
        entries.get(session_id).map(|e| e.session.clone())
    }

    /// Insert or replace, resetting the entry's TTL clock
    pub fn insert(&self, session: SessionData) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                session.session_id.clone(),
                CacheEntry {
                    session,
                    cached_at: Utc::now(),
                },
            );
        }
    }

    /// Drop an entry; no-op when absent
    pub fn evict(&self, session_id: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(session_id);
        }
    }

    /// Bump `last_activity` on a cached entry without touching its TTL clock
    ///
    /// Returns false when the session is not cached at all.
    pub fn update_activity(&self, session_id: &str, at: DateTime<Utc>) -> bool {
        if let Ok(mut entries) = self.entries.write() {
            if let Some(entry) = entries.get_mut(session_id) {
                entry.session.last_activity = at;
                return true;
            }
        }
        false
    }

    /// Drop entries whose sessions are past their explicit expiry
    ///
    /// TTL-stale entries survive this sweep; only dead sessions go.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        if let Ok(mut entries) = self.entries.write() {
            let before = entries.len();
            entries.retain(|_, e| e.session.expires_at > now);
            before - entries.len()
        } else {
            0
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFixtures;

    #[test]
    fn test_fresh_hit_inside_ttl() {
        let cache = SessionCache::new(Duration::minutes(5));
        let session = TestFixtures::session();
        cache.insert(session.clone());

        let hit = cache.get(&session.session_id).unwrap();
        assert_eq!(hit.session_id, session.session_id);
    }

    #[test]
    fn test_ttl_expired_entry_misses_but_stays_stale_readable() {
        // Zero TTL: every entry is immediately stale
        let cache = SessionCache::new(Duration::zero());
        let session = TestFixtures::session();
        cache.insert(session.clone());

        assert!(cache.get(&session.session_id).is_none());
        assert!(cache.get_stale(&session.session_id).is_some());
    }

    #[test]
    fn test_update_activity_mutates_cached_entry() {
        let cache = SessionCache::new(Duration::minutes(5));
        let session = TestFixtures::session();
        let id = session.session_id.clone();
        cache.insert(session);

        let later = Utc::now() + Duration::minutes(10);
        assert!(cache.update_activity(&id, later));
        assert_eq!(cache.get(&id).unwrap().last_activity, later);

        assert!(!cache.update_activity("unknown", later));
    }

    #[test]
    fn test_evict_is_idempotent() {
        let cache = SessionCache::new(Duration::minutes(5));
        let session = TestFixtures::session();
        let id = session.session_id.clone();
        cache.insert(session);

        cache.evict(&id);
        assert!(cache.get_stale(&id).is_none());
        cache.evict(&id);
    }

    #[test]
    fn test_purge_drops_only_dead_sessions() {
        let cache = SessionCache::new(Duration::zero());
        let live = TestFixtures::session();
        let dead = TestFixtures::expired_session();
        let live_id = live.session_id.clone();
        cache.insert(live);
        cache.insert(dead);

        let purged = cache.purge_expired();
        assert_eq!(purged, 1);
        // TTL-stale but not expired: survives the purge
        assert!(cache.get_stale(&live_id).is_some());
    }
}
