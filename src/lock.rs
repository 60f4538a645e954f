//! Distributed lock + shared write-through buffer (C9): cross-instance flush
//! coordination and delta merging for horizontally scaled deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Atomic-CAS lock contract. Two concurrent `acquire` calls on the same key
/// must produce exactly one winner, across instances when backed by a
/// shared store.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> bool;
    async fn release(&self, key: &str, holder_id: &str);
}

struct Entry {
    holder_id: String,
    expires_at: Instant,
}

/// Single-process reference implementation, backed by `DashMap` for
/// lock-free reads on the hot un-contended path. Suitable for tests and
/// single-node deployments; cross-instance correctness requires a shared
/// backend (e.g. `AdvisoryLockBackend`).
#[derive(Default)]
pub struct InMemoryLockStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    holder_id: holder_id.to_string(),
                    expires_at: now + ttl,
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.expires_at <= now || existing.holder_id == holder_id {
                    slot.insert(Entry {
                        holder_id: holder_id.to_string(),
                        expires_at: now + ttl,
                    });
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn release(&self, key: &str, holder_id: &str) {
        if let Some(entry) = self.entries.get(key) {
            if entry.holder_id != holder_id {
                return;
            }
        } else {
            return;
        }
        self.entries.remove(key);
    }
}

/// Represents the "native advisory lock on a shared database" path from the
/// design doc: deterministically hash the key to a pair of 32-bit ints and
/// call the backend's advisory-lock primitive. No concrete driver ships with
/// this crate; this trait is the plug point for one.
#[async_trait]
pub trait AdvisoryLockBackend: Send + Sync {
    async fn try_advisory_lock(&self, key1: i32, key2: i32) -> bool;
    async fn advisory_unlock(&self, key1: i32, key2: i32);
}

/// Splits an arbitrary string key into the two 32-bit ints an advisory-lock
/// primitive expects (e.g. Postgres's `pg_try_advisory_lock(int, int)`).
pub fn hash_lock_key(key: &str) -> (i32, i32) {
    let full = crc32fast::hash(key.as_bytes()) as u64;
    let salted = full.wrapping_mul(0x9E3779B97F4A7C15);
    ((salted >> 32) as i32, salted as i32)
}

/// Adapts any `AdvisoryLockBackend` to the `LockStore` contract used by the
/// gateway's flush coordination.
pub struct AdvisoryLockStore<B: AdvisoryLockBackend> {
    backend: B,
}

impl<B: AdvisoryLockBackend> AdvisoryLockStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: AdvisoryLockBackend> LockStore for AdvisoryLockStore<B> {
    async fn acquire(&self, key: &str, _holder_id: &str, _ttl: Duration) -> bool {
        let (k1, k2) = hash_lock_key(key);
        self.backend.try_advisory_lock(k1, k2).await
    }

    async fn release(&self, key: &str, _holder_id: &str) {
        let (k1, k2) = hash_lock_key(key);
        self.backend.advisory_unlock(k1, k2).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let lock = InMemoryLockStore::new();
        let a = lock.acquire("flush:gw-1", "instance-a", Duration::from_secs(30)).await;
        let b = lock.acquire("flush:gw-1", "instance-b", Duration::from_secs(30)).await;
        assert!(a);
        assert!(!b);
    }

    #[tokio::test]
    async fn release_by_holder_allows_reacquire() {
        let lock = InMemoryLockStore::new();
        assert!(lock.acquire("k", "a", Duration::from_secs(30)).await);
        lock.release("k", "a").await;
        assert!(lock.acquire("k", "b", Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() {
        let lock = InMemoryLockStore::new();
        assert!(lock.acquire("k", "a", Duration::from_secs(30)).await);
        lock.release("k", "b").await;
        assert!(!lock.acquire("k", "c", Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let lock = InMemoryLockStore::new();
        assert!(lock.acquire("k", "a", Duration::from_millis(10)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock.acquire("k", "b", Duration::from_secs(30)).await);
    }

    #[test]
    fn hash_lock_key_is_deterministic() {
        assert_eq!(hash_lock_key("flush:gw-1"), hash_lock_key("flush:gw-1"));
    }
}
