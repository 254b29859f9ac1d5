//! error.rs
//!
//! Единая таксономия ошибок бронирования и её отображение в HTTP-ответ
//! вида `{"success": false, "message": ...}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::services::payment::PaymentError;
use crate::services::scheduler::SchedulerError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("not authorized to perform this action")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("seats are not available: {}", .0.join(", "))]
    SeatConflict(Vec<String>),

    #[error("payment provider error: {0}")]
    PaymentProvider(#[from] PaymentError),

    #[error("{0}")]
    Validation(String),

    #[error("invalid webhook signature")]
    SignatureInvalid,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BookingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BookingError::Validation(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BookingError::Unauthenticated => StatusCode::UNAUTHORIZED,
            BookingError::Unauthorized => StatusCode::FORBIDDEN,
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::SeatConflict(_) => StatusCode::CONFLICT,
            BookingError::PaymentProvider(_) => StatusCode::BAD_GATEWAY,
            BookingError::Validation(_) | BookingError::SignatureInvalid => StatusCode::BAD_REQUEST,
            BookingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SeatConflict(seats) => BookingError::SeatConflict(seats),
            other => BookingError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        BookingError::Internal(err.to_string())
    }
}

impl From<SchedulerError> for BookingError {
    fn from(err: SchedulerError) -> Self {
        BookingError::Internal(err.to_string())
    }
}

#[derive(Serialize)]
pub struct ApiError {
    success: bool,
    message: String,
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Детали внутренних сбоев пишем в лог, клиенту отдаём общий текст
        let message = match &self {
            BookingError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                "Something went wrong, please try again later".to_string()
            }
            BookingError::PaymentProvider(e) => {
                tracing::error!("Payment provider error: {}", e);
                "Payment provider is unavailable, please try again later".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ApiError { success: false, message })).into_response()
    }
}

pub type ApiResult<T> = Result<T, BookingError>;
