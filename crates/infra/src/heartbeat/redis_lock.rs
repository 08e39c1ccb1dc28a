//! Redis-backed heartbeat locks: `SET NX PX` plus a token-checked release.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::lock::{HeartbeatLock, LockError};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLocks {
    client: Arc<redis::Client>,
}

impl RedisLocks {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LockError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection().map_err(|e| LockError::Backend(e.to_string()))?;
            f(&mut conn).map_err(|e| LockError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| LockError::Backend(format!("blocking redis task failed: {e}")))?
    }
}

#[async_trait]
impl HeartbeatLock for RedisLocks {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>, LockError> {
        let token = Uuid::now_v7().to_string();
        let key = name.to_string();
        let value = token.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let acquired: Option<String> = self
            .blocking(move |conn| {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query(conn)
            })
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn release(&self, name: &str, token: &str) -> Result<(), LockError> {
        let key = name.to_string();
        let token = token.to_string();
        let _: i64 = self
            .blocking(move |conn| redis::Script::new(RELEASE_SCRIPT).key(&key).arg(&token).invoke(conn))
            .await?;
        Ok(())
    }
}
