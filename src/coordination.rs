//! Distributed Coordination (C8): a single named leader-lease primitive
//! used to dedupe periodic jobs (heartbeat, metering, discovery, and
//! per-workspace lifecycle mutations) across horizontally scaled
//! control-plane replicas.
//!
//! A held lease is a courtesy, not a guarantee past its TTL — callers
//! doing long-running work must renew or accept that another replica
//! may start the same job concurrently once the TTL lapses.

use redis::AsyncCommands;

use crate::error::AnyError;

#[derive(Clone)]
pub struct Coordination {
    redis: redis::Client,
    /// Unique per-process token so this replica can only release a
    /// lease it actually holds, not one another replica re-acquired
    /// after this one's TTL expired.
    holder_token: String,
}

impl Coordination {
    pub fn new(redis: redis::Client) -> Self {
        Coordination {
            redis,
            holder_token: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn lease_key(name: &str) -> String {
        format!("lease:{name}")
    }

    pub async fn try_acquire_lease(&self, name: &str, ttl: std::time::Duration) -> Result<bool, AnyError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let acquired: bool = redis::cmd("SET")
            .arg(Self::lease_key(name))
            .arg(&self.holder_token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(acquired)
    }

    /// Release a held lease, but only if this replica's token is still
    /// the one stored — a Lua-scripted compare-and-del so a lease this
    /// replica lost to TTL expiry and another replica re-acquired is
    /// never yanked out from under its new holder.
    pub async fn release_lease(&self, name: &str) -> Result<(), AnyError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
        let _: i32 = redis::Script::new(SCRIPT)
            .key(Self::lease_key(name))
            .arg(&self.holder_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn renew_lease(&self, name: &str, ttl: std::time::Duration) -> Result<bool, AnyError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("PEXPIRE", KEYS[1], ARGV[2])
            else
                return 0
            end
        "#;
        let renewed: i32 = redis::Script::new(SCRIPT)
            .key(Self::lease_key(name))
            .arg(&self.holder_token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }
}
