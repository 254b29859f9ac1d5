//! payment.rs
//!
//! Сервисный слой для взаимодействия с внешним платёжным провайдером
//! (Stripe-совместимый Checkout API).
//!
//! Ключевые компоненты:
//! 1.  **CircuitBreaker**: паттерн "Автоматический выключатель", чтобы не
//!     долбить запросами неработающий провайдер.
//! 2.  **PaymentProvider**: контракт провайдера: создание и чтение сессии
//!     оплаты, возврат средств, разбор подписанных вебхуков.
//! 3.  **StripeClient**: HTTP-реализация контракта; все сетевые вызовы идут
//!     через `CircuitBreaker`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CircuitBreakerConfig, PaymentConfig};
use crate::services::signature::{self, SignatureError};

/// Ключ метаданных сессии, в котором лежит id брони.
pub const BOOKING_METADATA_KEY: &str = "booking_id";

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("circuit breaker is open - payment provider temporarily unavailable")]
    CircuitOpen,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid provider payload: {0}")]
    InvalidPayload(String),

    #[error("webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),
}

impl PaymentError {
    /// Сбой, который говорит о недоступности провайдера, а не об ошибке запроса.
    fn is_transient(&self) -> bool {
        match self {
            PaymentError::Http(_) => true,
            PaymentError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Состояния "Автоматического выключателя".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Нормальный режим: запросы разрешены.
    Closed,
    /// Блокировка после серии сбоев.
    Open,
    /// После таймаута пропускаем пробный запрос.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    timeout_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            timeout_duration: Duration::from_secs(timeout_seconds),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.timeout_seconds)
    }

    /// Можно ли выполнить следующий запрос к провайдеру.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let timed_out = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.timeout_duration)
                    .unwrap_or(true);
                if timed_out {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker transitioning to HalfOpen state");
                }
                timed_out
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit breaker recovered - transitioning to Closed state");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.failure_count += 1;

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                error!(
                    "Circuit breaker OPENED - {} failures reached threshold {}",
                    inner.failure_count, self.failure_threshold
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("Circuit breaker test failed - returning to Open state");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state
    }
}

// --- Модели контракта провайдера ---

/// Запрос на создание сессии оплаты.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub booking_id: Uuid,
    pub description: String,
    pub unit_amount: i64,
    pub quantity: u32,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutRequest {
    pub fn amount(&self) -> i64 {
        self.unit_amount * i64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Состояние сессии оплаты глазами провайдера.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub paid: bool,
    /// Ссылка на платёжный инструмент (payment intent), нужна для возврата.
    pub payment_ref: Option<String>,
    pub booking_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEventKind {
    SessionCompleted,
    AsyncPaymentSucceeded,
    SessionExpired,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: WebhookEventKind,
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundReceipt {
    pub id: String,
    pub amount: i64,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_session(&self, request: CheckoutRequest) -> Result<CheckoutSession, PaymentError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, PaymentError>;

    /// Закрывает сессию, чтобы по ней больше нельзя было заплатить.
    async fn expire_session(&self, session_id: &str) -> Result<(), PaymentError>;

    async fn refund(&self, payment_ref: &str) -> Result<RefundReceipt, PaymentError>;

    /// Проверяет подпись и разбирает событие вебхука.
    fn parse_webhook(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent, PaymentError>;
}

// --- Формат данных Stripe ---

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    url: Option<String>,
    payment_status: String,
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<StripeSession> for SessionInfo {
    fn from(s: StripeSession) -> Self {
        SessionInfo {
            booking_id: s
                .metadata
                .get(BOOKING_METADATA_KEY)
                .and_then(|id| Uuid::parse_str(id).ok()),
            paid: s.payment_status == "paid",
            payment_ref: s.payment_intent,
            id: s.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    amount: i64,
}

#[derive(Debug, Default, Deserialize)]
struct StripeErrorBody {
    error: Option<StripeErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

/// Проверяет подпись и декодирует тело вебхука в `WebhookEvent`.
pub fn decode_webhook(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<WebhookEvent, PaymentError> {
    signature::verify(
        payload,
        signature_header,
        secret,
        now.timestamp(),
        signature::DEFAULT_TOLERANCE_SECS,
    )?;

    let event: StripeEvent = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

    let kind = match event.event_type.as_str() {
        "checkout.session.completed" => WebhookEventKind::SessionCompleted,
        "checkout.session.async_payment_succeeded" => WebhookEventKind::AsyncPaymentSucceeded,
        "checkout.session.expired" => WebhookEventKind::SessionExpired,
        other => WebhookEventKind::Other(other.to_string()),
    };

    let session = match kind {
        WebhookEventKind::Other(_) => None,
        _ => {
            let session: StripeSession = serde_json::from_value(event.data.object)
                .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;
            Some(session.into())
        }
    };

    Ok(WebhookEvent { id: event.id, kind, session })
}

/// Клиент Stripe-совместимого Checkout API.
#[derive(Clone)]
pub struct StripeClient {
    base_url: String,
    secret_key: String,
    webhook_secret: String,
    currency: String,
    http_client: reqwest::Client,
    circuit_breaker: std::sync::Arc<CircuitBreaker>,
}

impl StripeClient {
    pub fn from_config(config: &PaymentConfig, breaker: &CircuitBreakerConfig) -> Result<Self, PaymentError> {
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            currency: config.currency.clone(),
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()?,
            circuit_breaker: std::sync::Arc::new(CircuitBreaker::from_config(breaker)),
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Выполняет операцию, пропуская её через Circuit Breaker.
    async fn execute_with_circuit_breaker<F, T>(&self, operation: F) -> Result<T, PaymentError>
    where
        F: std::future::Future<Output = Result<T, PaymentError>>,
    {
        if !self.circuit_breaker.can_execute() {
            warn!("Circuit breaker is OPEN - blocking payment provider request");
            return Err(PaymentError::CircuitOpen);
        }

        match operation.await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                error!("Payment provider request failed: {}", e);
                if e.is_transient() {
                    self.circuit_breaker.record_failure();
                }
                Err(e)
            }
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, PaymentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body: StripeErrorBody = response.json().await.unwrap_or_default();
        let message = body
            .error
            .and_then(|e| e.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
        Err(PaymentError::Api { status: status.as_u16(), message })
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, PaymentError> {
        let body = serde_urlencoded::to_string(params)
            .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

        let mut request = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.secret_key)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        Self::read_json(request.send().await?).await
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_session(&self, request: CheckoutRequest) -> Result<CheckoutSession, PaymentError> {
        let params: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            ("client_reference_id".into(), request.booking_id.to_string()),
            ("expires_at".into(), request.expires_at.timestamp().to_string()),
            ("line_items[0][quantity]".into(), request.quantity.to_string()),
            ("line_items[0][price_data][currency]".into(), self.currency.clone()),
            ("line_items[0][price_data][unit_amount]".into(), request.unit_amount.to_string()),
            ("line_items[0][price_data][product_data][name]".into(), request.description.clone()),
            (format!("metadata[{}]", BOOKING_METADATA_KEY), request.booking_id.to_string()),
        ];

        info!(
            "Creating checkout session: booking={}, amount={}, currency={}",
            request.booking_id,
            request.amount(),
            self.currency
        );

        let idempotency_key = format!("checkout-{}", request.booking_id);
        let operation = self.post_form::<StripeSession>("/v1/checkout/sessions", &params, Some(&idempotency_key));
        let session = self.execute_with_circuit_breaker(operation).await?;

        let url = session
            .url
            .ok_or_else(|| PaymentError::InvalidPayload("checkout session has no url".into()))?;
        Ok(CheckoutSession { id: session.id, url })
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, PaymentError> {
        let operation = async {
            let response = self
                .http_client
                .get(format!("{}/v1/checkout/sessions/{}", self.base_url, session_id))
                .bearer_auth(&self.secret_key)
                .send()
                .await?;
            Self::read_json::<StripeSession>(response).await
        };

        let session = self.execute_with_circuit_breaker(operation).await?;
        Ok(session.into())
    }

    async fn expire_session(&self, session_id: &str) -> Result<(), PaymentError> {
        let path = format!("/v1/checkout/sessions/{}/expire", session_id);
        let operation = self.post_form::<serde_json::Value>(&path, &[], None);
        self.execute_with_circuit_breaker(operation).await?;
        info!("Checkout session {} expired", session_id);
        Ok(())
    }

    async fn refund(&self, payment_ref: &str) -> Result<RefundReceipt, PaymentError> {
        let params = vec![("payment_intent".to_string(), payment_ref.to_string())];
        let idempotency_key = format!("refund-{}", payment_ref);
        let operation = self.post_form::<StripeRefund>("/v1/refunds", &params, Some(&idempotency_key));
        let refund = self.execute_with_circuit_breaker(operation).await?;

        info!("Refund {} issued for {}: amount={}", refund.id, payment_ref, refund.amount);
        Ok(RefundReceipt { id: refund.id, amount: refund.amount })
    }

    fn parse_webhook(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent, PaymentError> {
        decode_webhook(payload, signature_header, &self.webhook_secret, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str, threshold: u32) -> StripeClient {
        let config = PaymentConfig {
            api_url: base_url.to_string(),
            secret_key: "sk_test_123".into(),
            webhook_secret: "whsec_123".into(),
            currency: "inr".into(),
            timeout_seconds: 5,
        };
        let breaker = CircuitBreakerConfig { failure_threshold: threshold, timeout_seconds: 60 };
        StripeClient::from_config(&config, &breaker).unwrap()
    }

    fn checkout(booking_id: Uuid) -> CheckoutRequest {
        CheckoutRequest {
            booking_id,
            description: "Booking for Dune".into(),
            unit_amount: 250,
            quantity: 2,
            success_url: "http://localhost/my-bookings?session_id={CHECKOUT_SESSION_ID}".into(),
            cancel_url: "http://localhost/my-bookings".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        }
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_timeout() {
        let breaker = CircuitBreaker::new(2, 0);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // таймаут 0 секунд: следующий вызов сразу пробный
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_breaker_blocks_until_timeout() {
        let breaker = CircuitBreaker::new(1, 60);
        breaker.record_failure();
        assert!(!breaker.can_execute());
    }

    #[tokio::test]
    async fn create_session_sends_form_with_booking_metadata() {
        let server = MockServer::start().await;
        let booking_id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(body_string_contains(format!("metadata%5Bbooking_id%5D={}", booking_id)))
            .and(body_string_contains("line_items%5B0%5D%5Bquantity%5D=2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_test_1",
                "url": "https://checkout.example/cs_test_1",
                "payment_status": "unpaid",
                "payment_intent": null,
                "metadata": { "booking_id": booking_id.to_string() }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = client(&server.uri(), 5).create_session(checkout(booking_id)).await.unwrap();
        assert_eq!(session.id, "cs_test_1");
        assert_eq!(session.url, "https://checkout.example/cs_test_1");
    }

    #[tokio::test]
    async fn get_session_reports_paid_status_and_booking() {
        let server = MockServer::start().await;
        let booking_id = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_paid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_paid",
                "url": null,
                "payment_status": "paid",
                "payment_intent": "pi_42",
                "metadata": { "booking_id": booking_id.to_string() }
            })))
            .mount(&server)
            .await;

        let info = client(&server.uri(), 5).get_session("cs_paid").await.unwrap();
        assert!(info.paid);
        assert_eq!(info.payment_ref.as_deref(), Some("pi_42"));
        assert_eq!(info.booking_id, Some(booking_id));
    }

    #[tokio::test]
    async fn provider_outage_opens_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/refunds"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": { "message": "service unavailable" }
            })))
            .mount(&server)
            .await;

        let client = client(&server.uri(), 2);
        for _ in 0..2 {
            let err = client.refund("pi_1").await.unwrap_err();
            assert!(matches!(err, PaymentError::Api { status: 503, .. }));
        }
        assert_eq!(client.circuit_state(), CircuitState::Open);
        assert!(matches!(client.refund("pi_1").await.unwrap_err(), PaymentError::CircuitOpen));
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_the_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": { "message": "No such checkout session" }
            })))
            .mount(&server)
            .await;

        let client = client(&server.uri(), 1);
        let err = client.get_session("cs_missing").await.unwrap_err();
        assert!(matches!(err, PaymentError::Api { status: 404, ref message } if message == "No such checkout session"));
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn decode_webhook_extracts_completed_session() {
        let booking_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "payment_status": "paid",
                "payment_intent": "pi_1",
                "metadata": { "booking_id": booking_id.to_string() }
            }}
        })
        .to_string();
        let now = Utc::now();
        let header = signature::sign(payload.as_bytes(), "whsec_123", now.timestamp()).unwrap();

        let event = decode_webhook(payload.as_bytes(), &header, "whsec_123", now).unwrap();
        assert_eq!(event.kind, WebhookEventKind::SessionCompleted);
        let session = event.session.unwrap();
        assert!(session.paid);
        assert_eq!(session.booking_id, Some(booking_id));
    }

    #[test]
    fn decode_webhook_rejects_bad_signature() {
        let payload = br#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{}}}"#;
        let now = Utc::now();
        let header = signature::sign(payload, "wrong", now.timestamp()).unwrap();
        let err = decode_webhook(payload, &header, "whsec_123", now).unwrap_err();
        assert!(matches!(err, PaymentError::Signature(SignatureError::Mismatch)));
    }
}
