//! Per-repo concurrency leases.
//!
//! A leased slot in the KV counter bounds how many workers advance runs
//! for one repository at a time. The guard releases on drop; a crashed
//! worker's slot expires with the TTL.

use std::time::Duration;

use crate::kv::KvStore;

pub struct RepoLease {
    kv: KvStore,
    key: String,
    token: String,
}

impl RepoLease {
    /// Try to take one slot for `repo`. `None` means the repo is at its
    /// concurrency cap and the caller should back off and reschedule.
    pub fn try_acquire(
        kv: &KvStore,
        repo: &str,
        capacity: usize,
        ttl: Duration,
    ) -> Option<RepoLease> {
        let key = format!("repo_lease:{}", repo);
        let token = kv.try_acquire_lease(&key, capacity, ttl)?;
        Some(RepoLease {
            kv: kv.clone(),
            key,
            token,
        })
    }
}

impl Drop for RepoLease {
    fn drop(&mut self) {
        self.kv.release_lease(&self.key, &self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_bounds_concurrency_per_repo() {
        let kv = KvStore::new();
        let ttl = Duration::from_secs(60);
        let _a = RepoLease::try_acquire(&kv, "org/app", 2, ttl).unwrap();
        let _b = RepoLease::try_acquire(&kv, "org/app", 2, ttl).unwrap();
        assert!(RepoLease::try_acquire(&kv, "org/app", 2, ttl).is_none());
        // A different repo is unaffected.
        assert!(RepoLease::try_acquire(&kv, "org/other", 2, ttl).is_some());
    }

    #[test]
    fn dropping_the_guard_frees_the_slot() {
        let kv = KvStore::new();
        let ttl = Duration::from_secs(60);
        {
            let _guard = RepoLease::try_acquire(&kv, "org/app", 1, ttl).unwrap();
            assert!(RepoLease::try_acquire(&kv, "org/app", 1, ttl).is_none());
        }
        assert!(RepoLease::try_acquire(&kv, "org/app", 1, ttl).is_some());
    }
}
