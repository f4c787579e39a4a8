use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared Redis connection manager guarded by a Tokio mutex.
///
/// `ConnectionManager` reconnects on its own; the mutex only serializes
/// command submission from the service's tasks.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Redis connection pool used by the rate limiter, sweep lease, and
/// notification queue.
pub struct RedisPool {
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .context("failed to parse REDIS_URL connection string")?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;
        info!("Redis connection manager initialized");
        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    /// Round-trip a PING, for startup and health checks.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.lock().await;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await
            .context("redis PING failed")?;
        Ok(())
    }
}
