use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exclusive lock for one room. Cloning shares the same lock.
pub type KeyLock = Arc<Mutex<()>>;

struct LockEntry {
    lock: KeyLock,
    last_used: Instant,
}

/// Per-room lock table. Entries are created on first use and evicted by
/// [`LockRegistry::sweep_expired`] once idle longer than the expiration.
///
/// The table has its own synchronization (the map's shard locks), separate
/// from the room locks it hands out, so inserting or sweeping entries never
/// waits on a room lock holder.
pub struct LockRegistry {
    entries: DashMap<String, LockEntry>,
    expiration: Duration,
}

impl LockRegistry {
    pub fn new(expiration: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            expiration,
        }
    }

    /// Get the lock for `key`, creating it if needed. All callers racing on
    /// an unseen key receive the same lock.
    pub fn acquire(&self, key: &str) -> KeyLock {
        let now = Instant::now();
        let mut created = false;
        let lock = {
            let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| {
                created = true;
                LockEntry {
                    lock: Arc::new(Mutex::new(())),
                    last_used: now,
                }
            });
            entry.last_used = now;
            entry.lock.clone()
        };
        if created {
            metrics::gauge!(crate::observability::LOCK_TABLE_SIZE).set(self.entries.len() as f64);
        }
        lock
    }

    /// Acquire the room lock and wait until it is granted. Dropping the guard releases it.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.acquire(key).lock_owned().await
    }

    /// Drop every entry idle for longer than the expiration. Entries whose
    /// lock is still referenced outside the table (held, queued for, or
    /// about to be locked) are kept. Returns the number of evicted entries.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let idle = now.saturating_duration_since(entry.last_used);
            idle <= self.expiration || Arc::strong_count(&entry.lock) > 1
        });
        let after = self.entries.len();
        metrics::gauge!(crate::observability::LOCK_TABLE_SIZE).set(after as f64);
        let evicted = before.saturating_sub(after);
        if evicted > 0 {
            metrics::counter!(crate::observability::LOCK_ENTRIES_EVICTED_TOTAL).increment(evicted as u64);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Background task that periodically evicts idle lock entries until `shutdown` fires.
pub async fn run_sweeper(registry: Arc<LockRegistry>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = registry.sweep_expired(Instant::now());
                if evicted > 0 {
                    debug!("lock sweep evicted {evicted} entries, {} remain", registry.len());
                }
            }
            _ = shutdown.cancelled() => {
                debug!("lock sweeper stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn same_key_same_lock() {
        let registry = LockRegistry::new(TTL);
        let a = registry.acquire("room-1");
        let b = registry.acquire("room-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_keys_different_locks() {
        let registry = LockRegistry::new(TTL);
        let a = registry.acquire("room-1");
        let b = registry.acquire("room-2");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn racing_acquires_share_one_lock() {
        let registry = Arc::new(LockRegistry::new(TTL));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let reg = registry.clone();
            handles.push(tokio::spawn(async move { reg.acquire("contended") }));
        }
        let mut locks = Vec::new();
        for h in handles {
            locks.push(h.await.unwrap());
        }
        assert!(locks.iter().all(|l| Arc::ptr_eq(l, &locks[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_evicts_idle_entries() {
        let registry = LockRegistry::new(TTL);
        drop(registry.acquire("room-1"));
        drop(registry.acquire("room-2"));

        // Not idle long enough
        assert_eq!(registry.sweep_expired(Instant::now()), 0);
        assert_eq!(registry.len(), 2);

        let later = Instant::now() + TTL + Duration::from_secs(1);
        assert_eq!(registry.sweep_expired(later), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn access_refreshes_last_used() {
        let registry = LockRegistry::new(Duration::from_millis(50));
        drop(registry.acquire("room-1"));
        std::thread::sleep(Duration::from_millis(80));
        drop(registry.acquire("room-2"));
        drop(registry.acquire("room-1"));

        let evicted = registry.sweep_expired(Instant::now() + Duration::from_millis(10));
        assert_eq!(evicted, 0);
        assert!(registry.contains("room-1"));
    }

    #[tokio::test]
    async fn sweep_keeps_held_lock() {
        let registry = LockRegistry::new(TTL);
        let guard = registry.lock("room-1").await;

        let later = Instant::now() + TTL * 2;
        assert_eq!(registry.sweep_expired(later), 0);
        assert!(registry.contains("room-1"));

        // The next acquirer gets the same lock and has to wait for the holder
        let mut next = task::spawn(registry.lock("room-1"));
        assert_pending!(next.poll());
        drop(guard);
        assert!(next.is_woken());
        let _guard = assert_ready!(next.poll());
    }

    #[tokio::test]
    async fn outstanding_handle_blocks_eviction() {
        let registry = LockRegistry::new(TTL);
        let lock = registry.acquire("room-1");

        // An idle handle still counts as a reference, so the entry survives
        let later = Instant::now() + TTL * 2;
        assert_eq!(registry.sweep_expired(later), 0);

        let guard = lock.clone().lock_owned().await;
        let mut contender = task::spawn(registry.lock("room-1"));
        assert_pending!(contender.poll());
        drop(guard);
        drop(lock);
        let contender_guard = assert_ready!(contender.poll());
        drop(contender_guard);
        drop(contender);

        // Once nobody references it, the idle entry goes away and the next
        // caller gets a fresh, unlocked lock
        assert_eq!(registry.sweep_expired(later), 1);
        assert_eq!(registry.len(), 0);
        let fresh = registry.acquire("room-1");
        assert!(fresh.try_lock().is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let registry = Arc::new(LockRegistry::new(Duration::ZERO));
        drop(registry.acquire("room-1"));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            registry.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweeper never evicted the idle entry");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
