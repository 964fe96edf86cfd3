//! Distributed locks for the expired booking sweep.
//!
//! The in-process [`InMemoryLock`] covers single-instance deployments and
//! tests. With the `redis` feature, [`RedisLock`] provides a lease shared by
//! every instance pointed at the same Redis.

pub use cabinet_booking::memory::InMemoryLock;
pub use cabinet_booking::sweep::{DistributedLock, LockError, LockLease};

#[cfg(feature = "redis")]
pub use self::redis_lock::RedisLock;

#[cfg(feature = "redis")]
mod redis_lock {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::{debug, instrument};
    use uuid::Uuid;

    use super::{DistributedLock, LockError, LockLease};

    /// Deletes the key only while it still holds our token.
    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    /// Pushes the expiry out only while the key still holds our token.
    const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

    /// Lease lock on a Redis key (`SET key token NX PX ttl`).
    ///
    /// Commands run on a blocking connection inside `spawn_blocking`.
    #[derive(Debug, Clone)]
    pub struct RedisLock {
        client: Arc<redis::Client>,
    }

    impl RedisLock {
        pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
            let client = redis::Client::open(redis_url.as_ref())
                .map_err(|e| LockError::backend(format!("redis connection: {e}")))?;
            Ok(Self {
                client: Arc::new(client),
            })
        }

        async fn blocking<T, F>(&self, op: F) -> Result<T, LockError>
        where
            T: Send + 'static,
            F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
        {
            let client = self.client.clone();
            tokio::task::spawn_blocking(move || {
                let mut conn = client
                    .get_connection()
                    .map_err(|e| LockError::backend(format!("redis connection: {e}")))?;
                op(&mut conn).map_err(|e| LockError::backend(e.to_string()))
            })
            .await
            .map_err(|e| LockError::backend(format!("redis task failed: {e}")))?
        }
    }

    #[async_trait]
    impl DistributedLock for RedisLock {
        #[instrument(skip(self), err)]
        async fn try_acquire(
            &self,
            key: &str,
            ttl: Duration,
        ) -> Result<Option<LockLease>, LockError> {
            let token = Uuid::now_v7().to_string();
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let (k, t) = (key.to_string(), token.clone());
            let reply: Option<String> = self
                .blocking(move |conn| {
                    redis::cmd("SET")
                        .arg(&k)
                        .arg(&t)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_ms)
                        .query(conn)
                })
                .await?;

            if reply.is_none() {
                debug!(key, "lock held elsewhere");
                return Ok(None);
            }
            Ok(Some(LockLease {
                key: key.to_string(),
                token,
            }))
        }

        #[instrument(skip(self, lease), fields(key = %lease.key), err)]
        async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError> {
            let lease = lease.clone();
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let renewed: i64 = self
                .blocking(move |conn| {
                    redis::Script::new(RENEW_SCRIPT)
                        .key(&lease.key)
                        .arg(&lease.token)
                        .arg(ttl_ms)
                        .invoke(conn)
                })
                .await?;
            Ok(renewed == 1)
        }

        #[instrument(skip(self, lease), fields(key = %lease.key), err)]
        async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
            let lease = lease.clone();
            let deleted: i64 = self
                .blocking(move |conn| {
                    redis::Script::new(RELEASE_SCRIPT)
                        .key(&lease.key)
                        .arg(&lease.token)
                        .invoke(conn)
                })
                .await?;
            if deleted == 0 {
                debug!("lock lease had already expired");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn in_memory_lock_is_exclusive_until_released() {
        let lock = InMemoryLock::new();
        let lease = lock
            .try_acquire("sweep", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(lock.try_acquire("sweep", Duration::from_secs(60)).await.unwrap().is_none());

        lock.release(&lease).await.unwrap();
        assert!(lock.try_acquire("sweep", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn in_memory_lease_renews_only_while_held() {
        let lock = InMemoryLock::new();
        let lease = lock
            .try_acquire("sweep", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert!(lock.renew(&lease, Duration::from_secs(60)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(lock.try_acquire("sweep", Duration::from_secs(60)).await.unwrap().is_none());

        lock.release(&lease).await.unwrap();
        assert!(!lock.renew(&lease, Duration::from_secs(60)).await.unwrap());
    }
}
