#![forbid(unsafe_code)]

//! Redis adapter for the `tideflow` fast-path ports (companion crate).
//!
//! Bring your own `redis::Client`; each adapter holds a multiplexed
//! connection and speaks the command vocabulary the core's ports
//! expect: `GET`/`SET EX`/`TTL` for balance entries,
//! `ZADD`/`ZRANGEBYSCORE`/`ZREM` for the sync schedule, `SET NX EX` plus
//! a compare-and-delete script for locks, and `HGETALL` for the
//! stale-transaction queue.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tideflow::{
    BalanceCache, DistributedLock, Error, KeyTtl, Pingable, StaleQueue, SyncSchedule,
};

fn cache_err(err: redis::RedisError) -> Error {
    Error::Cache(err.to_string())
}

/// Release is conditional on the holder, so an expired lock cannot be
/// deleted by its former owner.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Balance cache and distributed locks over one shared keyspace.
#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RedisCache")
    }
}

impl RedisCache {
    pub async fn connect(client: &redis::Client) -> Result<Self, Error> {
        let connection =
            client.get_multiplexed_async_connection().await.map_err(cache_err)?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl Pingable for RedisCache {
    async fn ping(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .map_err(cache_err)?;
        Ok(())
    }
}

#[async_trait]
impl BalanceCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut connection = self.connection.clone();
        connection.get(key).await.map_err(cache_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        connection
            .set_ex(key, value, ttl.as_secs())
            .await
            .map_err(cache_err)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, Error> {
        let mut connection = self.connection.clone();
        let ttl: i64 = connection.ttl(key).await.map_err(cache_err)?;
        Ok(match ttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            secs => KeyTtl::Expires(Duration::from_secs(secs.max(0) as u64)),
        })
    }
}

#[async_trait]
impl DistributedLock for RedisCache {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, Error> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut connection)
            .await
            .map_err(cache_err)?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, Error> {
        let mut connection = self.connection.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(holder)
            .invoke_async(&mut connection)
            .await
            .map_err(cache_err)?;
        Ok(deleted == 1)
    }
}

/// The balance-sync schedule, one sorted set scored by due-at second.
#[derive(Clone)]
pub struct RedisSchedule {
    connection: MultiplexedConnection,
    key: String,
}

impl std::fmt::Debug for RedisSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisSchedule({})", self.key)
    }
}

impl RedisSchedule {
    pub async fn connect(client: &redis::Client, key: impl Into<String>) -> Result<Self, Error> {
        let connection =
            client.get_multiplexed_async_connection().await.map_err(cache_err)?;
        Ok(Self { connection, key: key.into() })
    }
}

#[async_trait]
impl SyncSchedule for RedisSchedule {
    async fn add(&self, member: &str, due_at: i64) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        connection.zadd(&self.key, member, due_at).await.map_err(cache_err)
    }

    async fn due_members(&self, now: i64, limit: usize) -> Result<Vec<String>, Error> {
        let mut connection = self.connection.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut connection)
            .await
            .map_err(cache_err)
    }

    async fn next_due(&self) -> Result<Option<i64>, Error> {
        let mut connection = self.connection.clone();
        let head: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut connection)
            .await
            .map_err(cache_err)?;
        Ok(head.first().map(|(_, score)| *score as i64))
    }

    async fn remove(&self, member: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        connection.zrem(&self.key, member).await.map_err(cache_err)
    }
}

/// The map of in-flight transaction records.
#[derive(Clone)]
pub struct RedisStaleQueue {
    connection: MultiplexedConnection,
    key: String,
}

impl std::fmt::Debug for RedisStaleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisStaleQueue({})", self.key)
    }
}

impl RedisStaleQueue {
    pub async fn connect(client: &redis::Client, key: impl Into<String>) -> Result<Self, Error> {
        let connection =
            client.get_multiplexed_async_connection().await.map_err(cache_err)?;
        Ok(Self { connection, key: key.into() })
    }
}

#[async_trait]
impl StaleQueue for RedisStaleQueue {
    async fn snapshot(&self) -> Result<Vec<(String, String)>, Error> {
        let mut connection = self.connection.clone();
        connection.hgetall(&self.key).await.map_err(cache_err)
    }
}
