use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::error::ApiResult;
use crate::BookingContext;

const SIGNATURE_HEADER: &str = "stripe-signature";

pub fn routes() -> Router<BookingContext> {
    Router::new().route("/stripe", post(payment_webhook))
}

/// POST /api/stripe
///
/// Тело читаем как есть: подпись считается по сырым байтам.
/// Ошибка подписи даёт 400, сбой хранилища даёт 500, и провайдер повторит доставку.
pub async fn payment_webhook(
    State(ctx): State<BookingContext>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if signature.is_none() {
        tracing::warn!("Webhook without {} header rejected", SIGNATURE_HEADER);
    }

    ctx.reconciler.handle_webhook(&body, signature, Utc::now()).await?;

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}
