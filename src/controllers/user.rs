use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

use crate::error::{ApiResult, BookingError};
use crate::middleware::AuthUser;
use crate::models::Movie;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/user/bookings", get(user_bookings))
        .route("/user/favorites", get(favorites).post(toggle_favorite))
}

// GET /api/user/bookings
async fn user_bookings(State(state): State<Arc<AppState>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let bookings = state.booking.store.user_bookings(&user.user_id).await?;
    Ok(Json(json!({ "success": true, "bookings": bookings })))
}

// GET /api/user/favorites
async fn favorites(State(state): State<Arc<AppState>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let movies = sqlx::query_as::<_, Movie>(
        r#"
        SELECT m.id, m.tmdb_id, m.title, m.overview, m.poster_path, m.backdrop_path,
               m.release_date, m.original_language, m.tagline, m.vote_average,
               m.runtime, m.genres, m.casts
        FROM user_favorites f
        JOIN movies m ON m.id = f.movie_id
        WHERE f.user_id = $1
        ORDER BY f.created_at DESC
        "#,
    )
    .bind(&user.user_id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(json!({ "success": true, "movies": movies })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ToggleFavoriteRequest {
    #[validate(range(min = 1, message = "movieId must be positive"))]
    movie_id: i64,
}

// POST /api/user/favorites: добавить или убрать фильм из избранного
async fn toggle_favorite(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<ToggleFavoriteRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(|e| BookingError::validation(e.to_string()))?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM movies WHERE id = $1)")
        .bind(req.movie_id)
        .fetch_one(&state.db.pool)
        .await?;
    if !exists {
        return Err(BookingError::NotFound("movie"));
    }

    let removed = sqlx::query("DELETE FROM user_favorites WHERE user_id = $1 AND movie_id = $2")
        .bind(&user.user_id)
        .bind(req.movie_id)
        .execute(&state.db.pool)
        .await?
        .rows_affected();

    if removed == 0 {
        sqlx::query(
            "INSERT INTO user_favorites (user_id, movie_id) VALUES ($1, $2)
             ON CONFLICT (user_id, movie_id) DO NOTHING",
        )
        .bind(&user.user_id)
        .bind(req.movie_id)
        .execute(&state.db.pool)
        .await?;
    }

    tracing::debug!("User {} favorite {} toggled (now favorite: {})", user.user_id, req.movie_id, removed == 0);

    Ok(Json(json!({
        "success": true,
        "message": "Favorite movies updated",
        "isFavorite": removed == 0,
    })))
}
