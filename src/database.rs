use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::config::DatabaseConfig;

// Хватает на короткие транзакции брони; дольше ждать соединение нет смысла
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Пул соединений Postgres, общий для хранилища броней и каталога.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .min_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .idle_timeout(IDLE_TIMEOUT)
            .connect(&config.url)
            .await?;

        info!("Postgres pool ready (max {} connections)", config.pool_size);
        Ok(Database { pool })
    }

    /// Применяет миграции из `src/migrations`, встроенные в бинарь.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./src/migrations").run(&self.pool).await?;
        info!("Booking schema is up to date");
        Ok(())
    }

    /// Проверка доступности базы для /health.
    pub async fn ping(&self) -> bool {
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Database ping failed: {}", e);
                false
            }
        }
    }
}
