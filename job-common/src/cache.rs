//! Redis-backed status, payload, and result cache.
//!
//! Keys are scoped by job id with a single-writer convention per key: the
//! submission service writes the initial `pending`, the worker writes every
//! status after that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

// average for all commands is <10ms, anything slower is treated as down
const REDIS_TIMEOUT_MILLISECS: u64 = 100;

#[derive(Envconfig, Clone)]
pub struct RedisConfig {
    #[envconfig(from = "REDIS_ADDR", default = "localhost:6379")]
    pub addr: String,

    #[envconfig(from = "REDIS_PASSWORD")]
    pub password: Option<String>,

    #[envconfig(from = "REDIS_DB", default = "0")]
    pub db: u32,
}

impl RedisConfig {
    /// Build a redis connection URL from the wiring parts.
    pub fn url(&self) -> String {
        let addr = self.addr.trim_start_matches("redis://");
        match &self.password {
            Some(password) => format!("redis://:{}@{}/{}", password, addr, self.db),
            None => format!("redis://{}/{}", addr, self.db),
        }
    }
}

pub fn status_key(id: i64) -> String {
    format!("job:{}", id)
}

pub fn payload_key(id: i64) -> String {
    format!("job:{}:payload", id)
}

pub fn result_key(id: i64) -> String {
    format!("job:{}:result", id)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("not found in cache")]
    NotFound,
    #[error("cache error: {0}")]
    Other(String),
    #[error("timed out waiting for cache")]
    Timeout,
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CacheError::Timeout
    }
}

/// A simplified wrapper over the redis commands the system needs.
#[async_trait]
pub trait Client: Send + Sync {
    async fn get(&self, k: String) -> Result<String, CacheError>;
    async fn set(&self, k: String, v: String) -> Result<(), CacheError>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CacheError>;
    async fn del(&self, k: String) -> Result<(), CacheError>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient, CacheError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CacheError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.get::<_, Option<String>>(k);
        let value = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        value.ok_or(CacheError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> Result<(), CacheError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.set::<_, _, ()>(k, v);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        Ok(())
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CacheError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.set_ex::<_, _, ()>(k, v, seconds as usize);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CacheError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.del::<_, ()>(k);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        Ok(())
    }
}

/// In-memory stand-in used by router and worker tests. Clones share state.
/// TTLs are recorded but never enforced; tests assert on presence.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("poisoned mock cache").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CacheError> {
        self.entries
            .lock()
            .expect("poisoned mock cache")
            .get(&k)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> Result<(), CacheError> {
        _ = self.entries.lock().expect("poisoned mock cache").insert(k, v);
        Ok(())
    }

    async fn setex(&self, k: String, v: String, _seconds: u64) -> Result<(), CacheError> {
        self.set(k, v).await
    }

    async fn del(&self, k: String) -> Result<(), CacheError> {
        _ = self.entries.lock().expect("poisoned mock cache").remove(&k);
        Ok(())
    }
}
