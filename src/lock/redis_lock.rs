//! Redis-backed [`DistributedLock`]: `SET key owner NX PX ttl_ms` to
//! acquire, a Lua compare-and-delete script to release safely (a plain
//! `GET` then `DEL` has a TOCTOU window between the two round trips; the
//! script makes the check-and-delete atomic on the server).

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{instrument, warn};

use super::distributed::{DistributedLock, LockError, LockOptions};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

pub struct RedisLock {
    client: redis::Client,
    release_script: redis::Script,
}

impl RedisLock {
    pub fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url).map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    #[instrument(skip(self))]
    async fn acquire(&self, key: &str, owner: &str, opts: LockOptions) -> Result<bool, LockError> {
        let mut con = self.connection().await?;
        let deadline = tokio::time::Instant::now() + opts.wait_time;

        loop {
            let acquired: Option<String> = con
                .set_options(
                    key,
                    owner,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(opts.ttl.as_millis() as usize)),
                )
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;

            if acquired.is_some() {
                return Ok(true);
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    #[instrument(skip(self))]
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let mut con = self.connection().await?;
        let result: i64 = self
            .release_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut con)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        if result == 0 {
            warn!(key, owner, "release was a no-op: lock already expired or held by another owner");
        }
        Ok(())
    }
}
