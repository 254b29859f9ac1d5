use redis::{aio::ConnectionManager, Client};
use tracing::warn;

/// Соединение с Redis, которое само переподключается после обрыва.
/// Очередь отложенных задач не должна умирать вместе с одним соединением.
#[derive(Clone)]
pub struct RedisClient {
    pub conn: ConnectionManager,
}

impl RedisClient {
    pub async fn new(redis_url: &str) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisClient { conn })
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Redis ping failed: {}", e);
                false
            }
        }
    }
}
