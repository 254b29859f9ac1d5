use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Сеанс: фильм в конкретном зале и в конкретное время.
/// Цена хранится в минимальных единицах валюты (пайсы, центы).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Show {
    pub id: i64,
    pub movie_id: i64,
    pub movie_title: String,
    pub theatre_id: Option<i64>,
    pub theatre_name: Option<String>,
    pub show_date_time: DateTime<Utc>,
    pub show_price: i64,
}

impl Show {
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.show_date_time <= now
    }
}
