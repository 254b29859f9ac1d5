use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ApiResult, BookingError};
use crate::models::Movie;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/shows", get(now_showing))
        .route("/shows/{movie_id}", get(movie_shows))
}

#[derive(Debug, Serialize)]
struct NowShowingResponse {
    success: bool,
    shows: Vec<Movie>,
}

// GET /api/shows: фильмы, у которых есть предстоящие сеансы
async fn now_showing(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let shows = state.cache.now_showing().await;
    Json(NowShowingResponse { success: true, shows })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShowSlot {
    pub time: DateTime<Utc>,
    pub show_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MovieShowsResponse {
    success: bool,
    movie: Movie,
    /// Дата (YYYY-MM-DD) -> сеансы этого дня
    date_time: BTreeMap<String, Vec<ShowSlot>>,
}

// GET /api/shows/{movie_id}
async fn movie_shows(
    State(state): State<Arc<AppState>>,
    Path(movie_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let movie = sqlx::query_as::<_, Movie>(
        "SELECT id, tmdb_id, title, overview, poster_path, backdrop_path, release_date,
                original_language, tagline, vote_average, runtime, genres, casts
         FROM movies WHERE id = $1",
    )
    .bind(movie_id)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or(BookingError::NotFound("movie"))?;

    let slots: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
        "SELECT id, show_date_time FROM shows
         WHERE movie_id = $1 AND show_date_time >= NOW()
         ORDER BY show_date_time",
    )
    .bind(movie_id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(MovieShowsResponse {
        success: true,
        movie,
        date_time: group_by_date(slots),
    }))
}

pub fn group_by_date(slots: Vec<(i64, DateTime<Utc>)>) -> BTreeMap<String, Vec<ShowSlot>> {
    let mut by_date: BTreeMap<String, Vec<ShowSlot>> = BTreeMap::new();
    for (show_id, time) in slots {
        by_date
            .entry(time.format("%Y-%m-%d").to_string())
            .or_default()
            .push(ShowSlot { time, show_id });
    }
    by_date
}
