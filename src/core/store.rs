//! Shared store access for the admission components.
//!
//! The rate limiter and threat detector coordinate across service instances
//! through a key-value store with atomic increments and per-key TTLs. The
//! [`Store`] trait captures exactly the operations they need; [`RedisStore`]
//! is the production implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

/// Errors surfaced by store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Store error: {0}")]
    Other(String),
}

/// Operations the admission components require from the shared store.
///
/// Counters carry a TTL set on first increment; block markers are plain
/// string values with a TTL; latency statistics live in a hash per source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Increment the integer counter at `key` by `amount` and return the new value.
    async fn incr_by(&self, key: &str, amount: u64) -> Result<u64, StoreError>;

    /// Set the TTL of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch a string value, `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a string value with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a key.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Remaining TTL of a key, `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Fetch all fields of a hash; an absent key yields an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Write the given fields into a hash.
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError>;
}

/// Redis-backed [`Store`] implementation
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Create a new store over an existing Redis client
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn incr_by(&self, key: &str, amount: u64) -> Result<u64, StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let count: u64 = conn.incr(key, amount).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.expire(key, ttl.as_secs() as usize).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs() as usize).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        // TTL returns -2 for a missing key and -1 for a key without expiry.
        let secs: i64 = conn.ttl(key).await?;
        if secs < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(secs as u64)))
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.hset_multiple(key, &fields).await?;
        Ok(())
    }
}
