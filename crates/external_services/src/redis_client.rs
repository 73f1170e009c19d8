//! Redis-backed shared store.
//!
//! A multiplexed connection is opened on first use and cloned per call. When a
//! call fails with a connection-level error the cached connection is dropped
//! and the next call dials again.

use crate::error::Result;
use crate::store::SharedStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Shared Redis client wrapper implementing [`SharedStore`].
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl RedisStore {
    /// Create a new shared Redis client. Does not connect until first use.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(Mutex::new(None)),
        })
    }

    /// Get an async connection, dialing if none is cached.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Pass a command result through, forgetting the cached connection if the
    /// socket is gone.
    async fn checked<T>(&self, result: RedisResult<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                warn!("Redis connection lost, reconnecting on next call: {}", e);
                self.conn.lock().await.take();
            }
        }
        Ok(result?)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<()> = redis::cmd("PING").query_async(&mut conn).await;
        self.checked(result).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<i64> = conn.incr(key, 1).await;
        self.checked(result).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result = conn.expire::<_, ()>(key, ttl.as_secs() as i64).await;
        self.checked(result).await
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<Option<i64>> = conn.get(key).await;
        self.checked(result).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<Vec<String>> = conn.keys(pattern).await;
        let keys = self.checked(result).await?;
        debug!("Pattern '{}' matched {} keys", pattern, keys.len());
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result = conn.hset::<_, _, _, ()>(key, field, value).await;
        self.checked(result).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<HashMap<String, String>> = conn.hgetall(key).await;
        self.checked(result).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result = conn.hdel::<_, _, ()>(key, field).await;
        self.checked(result).await
    }

    async fn replace_list(&self, key: &str, values: &[String]) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !values.is_empty() {
            pipe.rpush(key, values).ignore();
        }
        let result: RedisResult<()> = pipe.query_async(&mut conn).await;
        self.checked(result).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<Vec<String>> = conn.lrange(key, start, stop).await;
        self.checked(result).await
    }
}
