use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use crate::error::{ApiResult, BookingError};
use crate::middleware::AdminUser;
use crate::models::Show;
use crate::services::notifications::Notification;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/is-admin", get(is_admin))
        .route("/admin/dashboard", get(dashboard))
        .route("/admin/bookings", get(all_bookings))
        .route("/admin/shows", get(upcoming_shows).post(add_shows))
}

const UPCOMING_SHOWS_SQL: &str = r#"
    SELECT s.id, s.movie_id, m.title AS movie_title, s.theatre_id, t.name AS theatre_name,
           s.show_date_time, s.show_price
    FROM shows s
    JOIN movies m ON m.id = s.movie_id
    LEFT JOIN theatres t ON t.id = s.theatre_id
    WHERE s.show_date_time >= NOW()
    ORDER BY s.show_date_time
"#;

// GET /api/admin/is-admin
async fn is_admin(AdminUser(user): AdminUser) -> impl IntoResponse {
    Json(json!({ "success": true, "isAdmin": true, "userId": user.user_id }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardData {
    total_bookings: i64,
    /// Выручка за вычетом возвратов, в минимальных единицах валюты
    total_revenue: i64,
    active_shows: Vec<Show>,
    total_user: i64,
}

// GET /api/admin/dashboard
async fn dashboard(State(state): State<Arc<AppState>>, _admin: AdminUser) -> ApiResult<impl IntoResponse> {
    let (total_bookings, total_revenue): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(amount - refund_amount), 0)::BIGINT
         FROM bookings WHERE is_paid = true",
    )
    .fetch_one(&state.db.pool)
    .await?;

    // Пользователей сервис не хранит: считаем тех, кто хоть раз бронировал
    let total_user: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT user_id) FROM bookings")
        .fetch_one(&state.db.pool)
        .await?;

    let active_shows = sqlx::query_as::<_, Show>(UPCOMING_SHOWS_SQL)
        .fetch_all(&state.db.pool)
        .await?;

    Ok(Json(json!({
        "success": true,
        "dashboardData": DashboardData { total_bookings, total_revenue, active_shows, total_user },
    })))
}

// GET /api/admin/bookings
async fn all_bookings(State(state): State<Arc<AppState>>, _admin: AdminUser) -> ApiResult<impl IntoResponse> {
    let bookings = state.booking.store.all_bookings().await?;
    Ok(Json(json!({ "success": true, "bookings": bookings })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShowWithSeats {
    #[serde(flatten)]
    show: Show,
    occupied_seats: Vec<String>,
}

// GET /api/admin/shows: предстоящие сеансы с занятыми местами
async fn upcoming_shows(State(state): State<Arc<AppState>>, _admin: AdminUser) -> ApiResult<impl IntoResponse> {
    let shows = sqlx::query_as::<_, Show>(UPCOMING_SHOWS_SQL)
        .fetch_all(&state.db.pool)
        .await?;

    let ids: Vec<i64> = shows.iter().map(|s| s.id).collect();
    let rows: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT show_id, seat
        FROM bookings, unnest(booked_seats) AS seat
        WHERE show_id = ANY($1) AND is_cancelled = false
        ORDER BY seat
        "#,
    )
    .bind(&ids)
    .fetch_all(&state.db.pool)
    .await?;

    let mut occupied: HashMap<i64, Vec<String>> = HashMap::new();
    for (show_id, seat) in rows {
        occupied.entry(show_id).or_default().push(seat);
    }

    let shows: Vec<ShowWithSeats> = shows
        .into_iter()
        .map(|show| {
            let occupied_seats = occupied.remove(&show.id).unwrap_or_default();
            ShowWithSeats { show, occupied_seats }
        })
        .collect();

    Ok(Json(json!({ "success": true, "shows": shows })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShowDay {
    pub date: String,
    pub time: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct AddShowsRequest {
    #[validate(range(min = 1, message = "movieId must be positive"))]
    movie_id: i64,
    theatre_id: Option<i64>,
    #[validate(length(min = 1, message = "showsInput must not be empty"))]
    shows_input: Vec<ShowDay>,
    /// Цена места в минимальных единицах валюты
    #[validate(range(min = 1, message = "showPrice must be positive"))]
    show_price: i64,
}

/// Разворачивает "дата + список времён" в моменты начала сеансов (UTC).
pub fn expand_show_times(days: &[ShowDay]) -> Result<Vec<DateTime<Utc>>, BookingError> {
    let mut times = Vec::new();
    for day in days {
        let date = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d")
            .map_err(|_| BookingError::validation(format!("invalid date '{}'", day.date)))?;
        for raw in &day.time {
            let time = NaiveTime::parse_from_str(raw, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
                .map_err(|_| BookingError::validation(format!("invalid time '{}'", raw)))?;
            times.push(date.and_time(time).and_utc());
        }
    }
    if times.is_empty() {
        return Err(BookingError::validation("no show times given"));
    }
    times.sort();
    times.dedup();
    Ok(times)
}

// POST /api/admin/shows
async fn add_shows(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Json(req): Json<AddShowsRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(|e| BookingError::validation(e.to_string()))?;
    let times = expand_show_times(&req.shows_input)?;
    if times.iter().any(|t| *t <= Utc::now()) {
        return Err(BookingError::validation("show times must be in the future"));
    }

    let movie_title: String = sqlx::query_scalar("SELECT title FROM movies WHERE id = $1")
        .bind(req.movie_id)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or(BookingError::NotFound("movie"))?;

    let created = sqlx::query(
        r#"
        INSERT INTO shows (movie_id, theatre_id, show_date_time, show_price)
        SELECT $1, $2, t, $3 FROM unnest($4::timestamptz[]) AS t
        "#,
    )
    .bind(req.movie_id)
    .bind(req.theatre_id)
    .bind(req.show_price)
    .bind(&times)
    .execute(&state.db.pool)
    .await?
    .rows_affected();

    tracing::info!("Added {} shows for movie {} ({})", created, req.movie_id, movie_title);

    state.cache.invalidate_now_showing().await;
    state.booking.notifications.emit(Notification::NewShowAdded { movie_title });

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": "Show added successfully", "created": created })),
    ))
}
