//! Distributed lock: named, TTL-bounded mutual exclusion across worker
//! instances, used only for job coordination — never as a substitute
//! for per-row database locks.
//!
//! The real adapter is a SET-IF-NOT-EXISTS + TTL key-value store
//! operation with a compare-and-delete release keyed on a caller
//! token, so a holder can't release a lock it no longer owns after its
//! TTL has already expired and been reacquired by someone else. This
//! module defines the contract as a trait plus an in-memory fake for
//! tests, built around a token map the way a registry keyed on a
//! string name usually is.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

/// Opaque proof of ownership returned by a successful [`DistributedLock::acquire`].
/// The `token` must match at release time — holding the handle is not
/// itself sufficient, matching the compare-and-delete release contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
}

/// Named, TTL-bounded mutual exclusion across worker instances.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Non-blocking acquire: returns `None` immediately on contention,
    /// never waits.
    async fn acquire(&self, name: &str, ttl: Duration) -> Option<LockHandle>;

    /// Extend a held lock's TTL. Returns `false` if the handle's token
    /// no longer matches the current holder (lock expired and was
    /// reacquired by someone else).
    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> bool;

    /// Release a held lock. A no-op (but not an error) if the token no
    /// longer matches — releasing a lock you no longer hold must never
    /// evict the new holder.
    async fn release(&self, handle: &LockHandle);
}

struct Held {
    token: String,
    expires_at: Instant,
}

/// In-memory fake for single-process tests. Real deployments back this
/// trait with Redis (or an equivalent KV store)'s `SET key value NX PX
/// ttl` plus a Lua compare-and-delete for release.
#[derive(Default)]
pub struct InMemoryDistributedLock {
    held: tokio::sync::Mutex<HashMap<String, Held>>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Option<LockHandle> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if let Some(existing) = held.get(name) {
            if existing.expires_at > now {
                return None;
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            name.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );

        Some(LockHandle { name: name.to_string(), token })
    }

    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> bool {
        let mut held = self.held.lock().await;
        match held.get_mut(&handle.name) {
            Some(existing) if existing.token == handle.token => {
                existing.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    async fn release(&self, handle: &LockHandle) {
        let mut held = self.held.lock().await;
        if let Some(existing) = held.get(&handle.name) {
            if existing.token == handle.token {
                held.remove(&handle.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_first_holds() {
        let lock = InMemoryDistributedLock::new();
        let a = lock.acquire("expire_requests", Duration::from_secs(60)).await;
        assert!(a.is_some());

        let b = lock.acquire("expire_requests", Duration::from_secs(60)).await;
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn release_frees_the_name_for_reacquisition() {
        let lock = InMemoryDistributedLock::new();
        let a = lock.acquire("job", Duration::from_secs(60)).await.unwrap();
        lock.release(&a).await;

        let b = lock.acquire("job", Duration::from_secs(60)).await;
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired_by_another_holder() {
        let lock = InMemoryDistributedLock::new();
        let a = lock.acquire("job", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let b = lock.acquire("job", Duration::from_secs(60)).await;
        assert!(b.is_some());

        // The original holder's token is now stale; its release must not
        // evict the new holder.
        lock.release(&a).await;
        assert!(!lock.extend(&a, Duration::from_secs(60)).await);
        let b_handle = b.unwrap();
        assert!(lock.extend(&b_handle, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn extend_fails_for_a_stale_token() {
        let lock = InMemoryDistributedLock::new();
        let a = lock.acquire("job", Duration::from_secs(60)).await.unwrap();
        let stale = LockHandle { name: a.name.clone(), token: "not-the-real-token".to_string() };
        assert!(!lock.extend(&stale, Duration::from_secs(60)).await);
    }
}
