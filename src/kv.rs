//! In-process coordination substrate with Redis semantics.
//!
//! A keyed store of JSON values with TTL, plus leased counters used as
//! crash-safe semaphores (every slot expires on its own, so a worker that
//! dies without releasing cannot wedge a repo forever). The handle is
//! cheap to clone and injected at component construction; a Redis-backed
//! handle can replace it without touching callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

struct LeaseSlot {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct KvInner {
    entries: HashMap<String, Entry>,
    leases: HashMap<String, Vec<LeaseSlot>>,
}

/// Keyed KV store with TTL entries and leased counters.
#[derive(Clone, Default)]
pub struct KvStore {
    inner: Arc<Mutex<KvInner>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KvInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a JSON value under `key`, optionally expiring after `ttl`.
    pub fn set_json(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut inner = self.lock();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Fetch a JSON value, honoring expiry. Expired entries are removed.
    pub fn get_json(&self, key: &str) -> Option<Value> {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Delete an entry; returns whether it existed (and was unexpired).
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.remove(key) {
            Some(entry) => entry.expires_at.is_none_or(|at| at > Instant::now()),
            None => false,
        }
    }

    // ── Leased counters ──────────────────────────────────────────────

    /// Try to acquire one slot of the bounded counter at `key`.
    ///
    /// Returns a release token when fewer than `capacity` unexpired slots
    /// are held, `None` when the counter is saturated. Slots self-expire
    /// after `ttl`.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        capacity: usize,
        ttl: Duration,
    ) -> Option<String> {
        let mut inner = self.lock();
        let now = Instant::now();
        let slots = inner.leases.entry(key.to_string()).or_default();
        slots.retain(|slot| slot.expires_at > now);
        if slots.len() >= capacity {
            return None;
        }
        let token = Uuid::new_v4().to_string();
        slots.push(LeaseSlot {
            token: token.clone(),
            expires_at: now + ttl,
        });
        Some(token)
    }

    /// Release a previously acquired slot. Unknown tokens are a no-op
    /// (the slot may already have expired).
    pub fn release_lease(&self, key: &str, token: &str) {
        let mut inner = self.lock();
        if let Some(slots) = inner.leases.get_mut(key) {
            slots.retain(|slot| slot.token != token);
            if slots.is_empty() {
                inner.leases.remove(key);
            }
        }
    }

    /// Number of live (unexpired) slots held at `key`.
    pub fn lease_count(&self, key: &str) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.leases.get_mut(key) {
            Some(slots) => {
                slots.retain(|slot| slot.expires_at > now);
                slots.len()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_delete_round_trip() {
        let kv = KvStore::new();
        kv.set_json("post_merge:org/app:main", json!({"run_id": "r-1"}), None);
        assert_eq!(
            kv.get_json("post_merge:org/app:main").unwrap()["run_id"],
            "r-1"
        );
        assert!(kv.delete("post_merge:org/app:main"));
        assert!(kv.get_json("post_merge:org/app:main").is_none());
        assert!(!kv.delete("post_merge:org/app:main"));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let kv = KvStore::new();
        kv.set_json("cooldown:x", json!(1), Some(Duration::from_millis(10)));
        assert!(kv.get_json("cooldown:x").is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(kv.get_json("cooldown:x").is_none());
    }

    #[test]
    fn lease_respects_capacity() {
        let kv = KvStore::new();
        let t1 = kv
            .try_acquire_lease("repo:org/app", 2, Duration::from_secs(60))
            .unwrap();
        let _t2 = kv
            .try_acquire_lease("repo:org/app", 2, Duration::from_secs(60))
            .unwrap();
        assert!(
            kv.try_acquire_lease("repo:org/app", 2, Duration::from_secs(60))
                .is_none()
        );
        assert_eq!(kv.lease_count("repo:org/app"), 2);

        kv.release_lease("repo:org/app", &t1);
        assert_eq!(kv.lease_count("repo:org/app"), 1);
        assert!(
            kv.try_acquire_lease("repo:org/app", 2, Duration::from_secs(60))
                .is_some()
        );
    }

    #[test]
    fn expired_lease_slots_free_capacity() {
        let kv = KvStore::new();
        let _t = kv
            .try_acquire_lease("repo:org/app", 1, Duration::from_millis(10))
            .unwrap();
        assert!(
            kv.try_acquire_lease("repo:org/app", 1, Duration::from_millis(10))
                .is_none()
        );
        std::thread::sleep(Duration::from_millis(20));
        assert!(
            kv.try_acquire_lease("repo:org/app", 1, Duration::from_secs(60))
                .is_some()
        );
    }

    #[test]
    fn releasing_unknown_token_is_noop() {
        let kv = KvStore::new();
        kv.release_lease("repo:org/app", "no-such-token");
        assert_eq!(kv.lease_count("repo:org/app"), 0);
    }

    #[test]
    fn leases_are_keyed_per_repo() {
        let kv = KvStore::new();
        let _a = kv
            .try_acquire_lease("repo:org/a", 1, Duration::from_secs(60))
            .unwrap();
        assert!(
            kv.try_acquire_lease("repo:org/b", 1, Duration::from_secs(60))
                .is_some()
        );
    }
}
