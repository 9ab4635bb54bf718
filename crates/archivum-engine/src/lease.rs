//! TTL-bounded administrative leases
//!
//! Long-held exclusive work (a metadata cache rebuild, a GC cycle) takes a
//! named lease. Leases always expire; an expired lease is reclaimed by the
//! next acquirer. `force_release` exists for operators and is logged loudly.

use archivum_common::{Clock, Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Distinguishes successive grants of the same name
    pub token: u64,
}

pub struct LeaseManager {
    leases: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
    next_token: AtomicU64,
}

impl LeaseManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
            next_token: AtomicU64::new(1),
        }
    }

    /// Take `name` for `ttl`. Renews if `holder` already has it.
    pub fn acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now();
        let mut leases = self.leases.lock();

        if let Some(current) = leases.get(name) {
            if current.expires_at > now && current.holder != holder {
                return Err(Error::lock_contention(format!(
                    "lease {name} held by {} until {}",
                    current.holder, current.expires_at
                )));
            }
            if current.expires_at <= now {
                info!(
                    lease = name,
                    previous_holder = %current.holder,
                    expired_at = %current.expires_at,
                    "Reclaiming expired lease"
                );
            }
        }

        let lease = Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        };
        leases.insert(name.to_string(), lease.clone());
        debug!(lease = name, holder, expires_at = %lease.expires_at, "Lease acquired");
        Ok(lease)
    }

    /// Give a lease back. A lease that was reclaimed or force-released is not touched.
    pub fn release(&self, lease: &Lease) -> bool {
        let mut leases = self.leases.lock();
        if leases.get(&lease.name).is_some_and(|l| l.token == lease.token) {
            leases.remove(&lease.name);
            true
        } else {
            false
        }
    }

    /// Current unexpired holder of `name`
    #[must_use]
    pub fn current(&self, name: &str) -> Option<Lease> {
        let now = self.clock.now();
        self.leases
            .lock()
            .get(name)
            .filter(|l| l.expires_at > now)
            .cloned()
    }

    /// Break a lease regardless of holder.
    ///
    /// The previous holder is not notified and may still be running.
    pub fn force_release(&self, name: &str, operator: &str) -> Option<Lease> {
        let removed = self.leases.lock().remove(name);
        if let Some(lease) = &removed {
            warn!(
                lease = name,
                holder = %lease.holder,
                operator,
                expires_at = %lease.expires_at,
                "DANGEROUS: lease force-released while possibly still in use"
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivum_common::ManualClock;

    #[test]
    fn test_lease_excludes_other_holders_until_expiry() {
        let clock = ManualClock::shared();
        let leases = LeaseManager::new(clock.clone());
        let ttl = Duration::minutes(60);

        let first = leases.acquire("metadata-rebuild", "alice", ttl).unwrap();
        let err = leases.acquire("metadata-rebuild", "bob", ttl).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));

        clock.advance(Duration::minutes(61));
        assert!(leases.current("metadata-rebuild").is_none());
        let second = leases.acquire("metadata-rebuild", "bob", ttl).unwrap();
        assert_ne!(first.token, second.token);

        // The stale grant cannot release the new one
        assert!(!leases.release(&first));
        assert_eq!(leases.current("metadata-rebuild").unwrap().holder, "bob");
        assert!(leases.release(&second));
    }

    #[test]
    fn test_same_holder_renews() {
        let clock = ManualClock::shared();
        let leases = LeaseManager::new(clock.clone());
        let a = leases.acquire("gc", "node-1", Duration::minutes(5)).unwrap();
        clock.advance(Duration::minutes(4));
        let b = leases.acquire("gc", "node-1", Duration::minutes(5)).unwrap();
        assert!(b.expires_at > a.expires_at);
    }

    #[test]
    fn test_force_release() {
        let leases = LeaseManager::new(ManualClock::shared());
        let lease = leases.acquire("gc", "stuck", Duration::hours(1)).unwrap();
        let broken = leases.force_release("gc", "operator").unwrap();
        assert_eq!(broken.holder, "stuck");
        assert!(leases.acquire("gc", "other", Duration::hours(1)).is_ok());
        assert!(!leases.release(&lease));
        assert!(leases.force_release("nothing", "operator").is_none());
    }
}
