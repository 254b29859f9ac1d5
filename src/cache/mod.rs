//! Кеш каталога в Redis. Источник истины всегда Postgres: при любой
//! ошибке Redis данные читаются из базы.

use tracing::info;

use crate::{database::Database, redis_client::RedisClient};

pub mod shows;

#[derive(Clone)]
pub struct CacheService {
    redis: RedisClient,
    db: Database,
}

impl CacheService {
    pub fn new(redis: RedisClient, db: Database) -> Self {
        Self { redis, db }
    }

    /// Заполняет список "сейчас в прокате" до первого запроса.
    pub async fn warmup_cache(&self) {
        let movies = self.now_showing().await;
        info!("Cache warmed up: {} movies with upcoming shows", movies.len());
    }
}
