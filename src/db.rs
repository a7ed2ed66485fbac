// src/db.rs
use std::sync::Arc;

use redis::{aio::ConnectionManager, Client};
use tracing::info;

use crate::config::{Config, StoreBackend};
use crate::error::StoreError;
use crate::store::{KvStore, MemoryStore, RedisStore};

pub async fn create_store(config: &Config) -> Result<Arc<dyn KvStore>, StoreError> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let client = Client::open(config.redis_url.as_str())
                .map_err(|e| StoreError::Connection(e.to_string()))?;

            let conn = tokio::time::timeout(config.store_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| StoreError::Timeout)??;

            let mut ping = conn.clone();
            let pong: String = tokio::time::timeout(
                config.store_timeout,
                redis::cmd("PING").query_async(&mut ping),
            )
            .await
            .map_err(|_| StoreError::Timeout)??;
            info!("Redis connected: {pong}");

            Ok(Arc::new(RedisStore::new(conn, config.store_timeout)))
        }
    }
}
