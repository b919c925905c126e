//! Redis layer backing the idempotency store.
//!
//! Connections come from a `bb8` pool. Keys are laid out by [`keys`].

pub mod error;
pub mod idempotency;
pub mod keys;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::CacheConfig;

pub use error::{CacheError, CacheResult};
pub use idempotency::RedisIdempotencyStore;

pub type RedisPool = Pool<RedisConnectionManager>;

#[derive(Debug, Clone)]
pub struct CachePoolConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub min_idle: u32,
    /// Checkout timeout; a slow Redis turns into 503s instead of hung requests
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&CacheConfig> for CachePoolConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            redis_url: config.redis_url.clone(),
            max_connections: config.max_connections.max(1),
            min_idle: config.max_connections.min(2),
            connection_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

pub async fn init_cache_pool(config: CachePoolConfig) -> CacheResult<RedisPool> {
    info!(
        max_connections = config.max_connections,
        "initializing Redis pool"
    );

    let manager = RedisConnectionManager::new(config.redis_url.as_str()).map_err(|e| {
        error!(error = %e, "invalid Redis URL");
        CacheError::from(e)
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .idle_timeout(config.idle_timeout)
        .build(manager)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to build Redis pool");
            CacheError::from(e)
        })?;

    // Write endpoints answer 503 while Redis is down; startup does not wait.
    if let Err(e) = health_check(&pool).await {
        warn!(error = %e, "Redis not reachable at startup");
    }

    Ok(pool)
}

/// `PING` through the pool.
pub async fn health_check(pool: &RedisPool) -> CacheResult<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}
