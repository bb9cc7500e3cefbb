//! [`DistributedLock`] contract.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock not acquired for key {key}")]
    NotAcquired { key: String },

    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

/// Acquisition parameters: how long to wait for the lock before giving up,
/// and how long the lock is held before it expires on its own.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub wait_time: Duration,
    pub ttl: Duration,
}

impl LockOptions {
    pub fn new(wait_time: Duration, ttl: Duration) -> Self {
        Self { wait_time, ttl }
    }

    /// Default used by the event-processing path: 5 s wait, 60 s TTL.
    pub fn event_processing_default() -> Self {
        Self {
            wait_time: Duration::from_secs(5),
            ttl: Duration::from_secs(60),
        }
    }
}

/// A short-lived named exclusion primitive with owner token and TTL.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// `SET key owner NX` with expiry `opts.ttl`; on contention, retry with
    /// small backoff until `opts.wait_time` elapses. Returns `true` iff the
    /// lock was acquired.
    async fn acquire(&self, key: &str, owner: &str, opts: LockOptions) -> Result<bool, LockError>;

    /// Compare-and-delete: releases `key` only if its stored value equals
    /// `owner`; otherwise a no-op (the lock already expired and was taken by
    /// someone else).
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError>;
}

/// Convenience wrapper: acquire or return [`LockError::NotAcquired`].
pub async fn acquire_or_err(
    lock: &dyn DistributedLock,
    key: &str,
    owner: &str,
    opts: LockOptions,
) -> Result<(), LockError> {
    if lock.acquire(key, owner, opts).await? {
        Ok(())
    } else {
        Err(LockError::NotAcquired { key: key.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;

    use parking_lot::Mutex;

    /// TTL-respecting double standing in for Redis's `PX` expiry, so a
    /// worker-crash-then-takeover scenario can be exercised without a real
    /// Redis instance or a paused clock.
    #[derive(Default)]
    struct ExpiringLock {
        held: Mutex<HashMap<String, (String, Instant)>>,
    }

    #[async_trait]
    impl DistributedLock for ExpiringLock {
        async fn acquire(&self, key: &str, owner: &str, opts: LockOptions) -> Result<bool, LockError> {
            let mut held = self.held.lock();
            if let Some((_, expires_at)) = held.get(key) {
                if *expires_at > Instant::now() {
                    return Ok(false);
                }
            }
            held.insert(key.to_string(), (owner.to_string(), Instant::now() + opts.ttl));
            Ok(true)
        }

        async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
            let mut held = self.held.lock();
            if held.get(key).map(|(o, _)| o.as_str()) == Some(owner) {
                held.remove(key);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_owner_is_rejected_while_the_first_holds_an_unexpired_lock() {
        let lock = ExpiringLock::default();
        let opts = LockOptions::new(Duration::from_millis(10), Duration::from_secs(60));

        assert!(lock.acquire("event:1", "worker-a", opts).await.unwrap());
        assert!(!lock.acquire("event:1", "worker-b", opts).await.unwrap());
    }

    #[tokio::test]
    async fn a_crashed_owners_lock_is_takeable_once_its_ttl_elapses() {
        let lock = ExpiringLock::default();
        let short_ttl = LockOptions::new(Duration::from_millis(10), Duration::from_millis(20));

        assert!(lock.acquire("event:1", "worker-a", short_ttl).await.unwrap());
        // `worker-a` crashes here without releasing; nothing short of TTL
        // expiry frees the key.
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(lock.acquire("event:1", "worker-b", short_ttl).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_a_no_op_when_the_caller_is_not_the_current_owner() {
        let lock = ExpiringLock::default();
        let opts = LockOptions::event_processing_default();

        lock.acquire("event:1", "worker-a", opts).await.unwrap();
        lock.release("event:1", "worker-b").await.unwrap();

        // Still held by `worker-a`: a second acquire by anyone else fails.
        assert!(!lock.acquire("event:1", "worker-c", opts).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_or_err_maps_a_failed_acquire_to_not_acquired() {
        let lock = ExpiringLock::default();
        let opts = LockOptions::event_processing_default();
        lock.acquire("event:1", "worker-a", opts).await.unwrap();

        let result = acquire_or_err(&lock, "event:1", "worker-b", opts).await;
        assert!(matches!(result, Err(LockError::NotAcquired { key }) if key == "event:1"));
    }
}
