use crate::cache::CacheService;
use crate::models::Movie;
use redis::AsyncCommands;
use tracing::warn;

const NOW_SHOWING_KEY: &str = "shows:now_showing";
// Список зависит от текущего времени, поэтому живёт недолго
const NOW_SHOWING_TTL_SECS: u64 = 60;

impl CacheService {
    /// Фильмы, у которых есть предстоящие сеансы.
    pub async fn now_showing(&self) -> Vec<Movie> {
        // Сначала пробуем кеш
        if let Ok(movies) = self.now_showing_from_cache().await {
            return movies;
        }

        // Если кеш не работает - идем в БД
        match self.load_now_showing_from_db().await {
            Ok(movies) => {
                if let Err(e) = self.save_now_showing_to_cache(&movies).await {
                    warn!("Failed to cache now showing list: {}", e);
                }
                movies
            }
            Err(e) => {
                warn!("Failed to load now showing list: {}", e);
                vec![]
            }
        }
    }

    /// Сбрасывает список после добавления сеансов.
    pub async fn invalidate_now_showing(&self) {
        let mut conn = self.redis.conn.clone();
        let result: Result<i64, _> = conn.del(NOW_SHOWING_KEY).await;
        if let Err(e) = result {
            warn!("Failed to invalidate now showing cache: {}", e);
        }
    }

    async fn load_now_showing_from_db(&self) -> Result<Vec<Movie>, sqlx::Error> {
        sqlx::query_as::<_, Movie>(
            r#"
            SELECT m.id, m.tmdb_id, m.title, m.overview, m.poster_path, m.backdrop_path,
                   m.release_date, m.original_language, m.tagline, m.vote_average,
                   m.runtime, m.genres, m.casts
            FROM movies m
            JOIN (
                SELECT movie_id, MIN(show_date_time) AS next_show
                FROM shows
                WHERE show_date_time >= NOW()
                GROUP BY movie_id
            ) upcoming ON upcoming.movie_id = m.id
            ORDER BY upcoming.next_show
            "#,
        )
        .fetch_all(&self.db.pool)
        .await
    }

    // === Работа с кешем ===
    async fn now_showing_from_cache(&self) -> Result<Vec<Movie>, redis::RedisError> {
        let mut conn = self.redis.conn.clone();
        let data: String = conn.get(NOW_SHOWING_KEY).await?;
        let movies: Vec<Movie> = serde_json::from_str(&data)
            .map_err(|_| redis::RedisError::from((redis::ErrorKind::TypeError, "Parse error")))?;
        Ok(movies)
    }

    async fn save_now_showing_to_cache(&self, movies: &[Movie]) -> Result<(), redis::RedisError> {
        let data = serde_json::to_string(movies)
            .map_err(|_| redis::RedisError::from((redis::ErrorKind::TypeError, "Serialize error")))?;
        let mut conn = self.redis.conn.clone();
        conn.set_ex(NOW_SHOWING_KEY, data, NOW_SHOWING_TTL_SECS).await
    }
}
