//! Named, expiring, non-blocking locks for heartbeat tasks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),

    #[error("lock state poisoned")]
    Poisoned,
}

/// At most one holder per name. Acquisition never waits.
#[async_trait]
pub trait HeartbeatLock: Send + Sync + 'static {
    /// A release token when the lock was free, `None` when someone holds it.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>, LockError>;

    /// Release only if `token` still owns the lock.
    async fn release(&self, name: &str, token: &str) -> Result<(), LockError>;
}

/// Process-local locks; expired entries are free for the taking.
#[derive(Debug, Default)]
pub struct InMemoryLocks {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeartbeatLock for InMemoryLocks {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        let now = Instant::now();
        if matches!(held.get(name), Some((_, expires_at)) if *expires_at > now) {
            return Ok(None);
        }
        let token = Uuid::now_v7().to_string();
        held.insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        if matches!(held.get(name), Some((owner, _)) if owner == token) {
            held.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn held_lock_blocks_until_released_or_expired() {
        let locks = InMemoryLocks::new();
        let ttl = Duration::from_secs(120);

        let token = locks.try_acquire("forgejobs:lock:a", ttl).await.unwrap().unwrap();
        assert!(locks.try_acquire("forgejobs:lock:a", ttl).await.unwrap().is_none());
        assert!(locks.try_acquire("forgejobs:lock:b", ttl).await.unwrap().is_some());

        locks.release("forgejobs:lock:a", "someone-else").await.unwrap();
        assert!(locks.try_acquire("forgejobs:lock:a", ttl).await.unwrap().is_none());

        locks.release("forgejobs:lock:a", &token).await.unwrap();
        let token = locks.try_acquire("forgejobs:lock:a", ttl).await.unwrap();
        assert!(token.is_some());

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(locks.try_acquire("forgejobs:lock:a", ttl).await.unwrap().is_some());
    }
}
