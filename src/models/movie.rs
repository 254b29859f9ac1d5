use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Метаданные фильма, однажды загруженные из внешнего каталога.
/// Для этого сервиса только для чтения.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: i64,
    pub tmdb_id: Option<i64>,
    pub title: String,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    pub backdrop_path: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub original_language: Option<String>,
    pub tagline: Option<String>,
    pub vote_average: Option<f64>,
    pub runtime: Option<i32>,
    pub genres: sqlx::types::Json<Vec<serde_json::Value>>,
    pub casts: sqlx::types::Json<Vec<serde_json::Value>>,
}
