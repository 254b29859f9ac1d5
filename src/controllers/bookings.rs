use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiResult, BookingError};
use crate::middleware::AuthUser;
use crate::models::BookingView;
use crate::services::reconciliation::{ConfirmOutcome, VerifyOutcome};
use crate::services::reservation::ReserveRequest;
use crate::BookingContext;

pub fn routes() -> Router<BookingContext> {
    Router::new()
        .route("/bookings/create", post(create_booking))
        .route("/bookings/verify", post(verify_payment))
        .route("/bookings/my-bookings", get(my_bookings))
        .route("/bookings/seats/{show_id}", get(occupied_seats))
        .route("/bookings/{booking_id}/cancel", post(cancel_booking))
}

/* ---------- helpers ---------- */

fn validate<T: Validate>(req: &T) -> Result<(), BookingError> {
    req.validate().map_err(|e| BookingError::validation(e.to_string()))
}

// Страница возврата после оплаты строится от Origin запроса
fn return_origin(headers: &HeaderMap, fallback: &str) -> String {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.starts_with("http://") || v.starts_with("https://"))
        .unwrap_or(fallback)
        .trim_end_matches('/')
        .to_string()
}

/* ---------- BOOKINGS ---------- */

// POST /api/bookings/create
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateBookingRequest {
    #[validate(range(min = 1, message = "showId must be positive"))]
    show_id: i64,
    #[serde(alias = "selectedSeats")]
    #[validate(length(min = 1, message = "at least one seat must be selected"))]
    seats: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBookingResponse {
    success: bool,
    url: String,
    booking_id: Uuid,
    amount: i64,
    release_at: chrono::DateTime<Utc>,
}

async fn create_booking(
    State(ctx): State<BookingContext>,
    user: AuthUser,
    headers: HeaderMap,
    Json(req): Json<CreateBookingRequest>,
) -> ApiResult<impl IntoResponse> {
    validate(&req)?;

    let origin = return_origin(&headers, &ctx.frontend_url);
    let reservation = ctx
        .reservations
        .reserve(
            ReserveRequest {
                show_id: req.show_id,
                user_id: user.user_id,
                seats: req.seats,
                success_url: format!("{}/my-bookings?session_id={{CHECKOUT_SESSION_ID}}", origin),
                cancel_url: format!("{}/my-bookings", origin),
            },
            Utc::now(),
        )
        .await?;

    Ok(Json(CreateBookingResponse {
        success: true,
        url: reservation.payment_url,
        booking_id: reservation.booking_id,
        amount: reservation.amount,
        release_at: reservation.release_at,
    }))
}

// POST /api/bookings/verify
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct VerifyPaymentRequest {
    #[validate(length(min = 1, message = "sessionId is required"))]
    session_id: String,
}

async fn verify_payment(
    State(ctx): State<BookingContext>,
    _user: AuthUser,
    Json(req): Json<VerifyPaymentRequest>,
) -> ApiResult<impl IntoResponse> {
    validate(&req)?;

    let body = match ctx.reconciler.verify_session(&req.session_id).await? {
        VerifyOutcome::Paid(outcome) if outcome.is_paid() => {
            json!({ "success": true, "message": "Payment verified" })
        }
        VerifyOutcome::Paid(ConfirmOutcome::LatePayment { refunded, .. }) => json!({
            "success": false,
            "message": "Booking expired before payment was received",
            "refunded": refunded,
        }),
        _ => json!({ "success": false, "message": "Payment not verified" }),
    };
    Ok(Json(body))
}

// GET /api/bookings/my-bookings
#[derive(Debug, Serialize)]
struct BookingsResponse {
    success: bool,
    bookings: Vec<BookingView>,
}

async fn my_bookings(State(ctx): State<BookingContext>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let bookings = ctx.store.user_bookings(&user.user_id).await?;
    Ok(Json(BookingsResponse { success: true, bookings }))
}

// GET /api/bookings/seats/{show_id}
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OccupiedSeatsResponse {
    success: bool,
    occupied_seats: Vec<String>,
}

async fn occupied_seats(
    State(ctx): State<BookingContext>,
    Path(show_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if ctx.store.show(show_id).await?.is_none() {
        return Err(BookingError::NotFound("show"));
    }
    let occupied_seats = ctx.store.occupied_seats(show_id).await?;
    Ok(Json(OccupiedSeatsResponse { success: true, occupied_seats }))
}

// POST /api/bookings/{booking_id}/cancel
async fn cancel_booking(
    State(ctx): State<BookingContext>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let outcome = ctx.cancellations.cancel(booking_id, &user.user_id, Utc::now()).await?;
    let message = if outcome.refunded {
        "Booking cancelled and refunded"
    } else {
        "Booking cancelled"
    };
    Ok(Json(json!({
        "success": true,
        "message": message,
        "refunded": outcome.refunded,
        "refundAmount": outcome.refund_amount,
    })))
}
