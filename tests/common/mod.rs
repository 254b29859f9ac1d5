#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use showtime_booking::config::{BookingConfig, WorkerConfig};
use showtime_booking::middleware::{Claims, IdentityVerifier};
use showtime_booking::models::{Booking, BookingView, NewBooking, PaymentTransition, Show};
use showtime_booking::services::notifications::{
    Notification, NotificationSink, Notifier, NotifyError, OutboundMessage,
};
use showtime_booking::services::payment::{
    decode_webhook, CheckoutRequest, CheckoutSession, PaymentError, PaymentProvider, RefundReceipt,
    SessionInfo, WebhookEvent,
};
use showtime_booking::services::reaper::ExpiryReaper;
use showtime_booking::services::reservation::ReserveRequest;
use showtime_booking::services::scheduler::MemoryScheduler;
use showtime_booking::services::signature;
use showtime_booking::services::worker::TaskWorker;
use showtime_booking::store::{BookingStore, MemoryStore, StoreError, StoreResult};
use showtime_booking::BookingContext;

pub const WEBHOOK_SECRET: &str = "whsec_test";
pub const JWT_SECRET: &str = "jwt_test_secret";
pub const SHOW_ID: i64 = 1;
pub const SEAT_PRICE: i64 = 25_000;

#[derive(Debug, Clone)]
pub struct FakeSession {
    pub booking_id: Uuid,
    pub amount: i64,
    pub paid: bool,
    pub expired: bool,
}

/// Провайдер оплаты в памяти: сессии, оплата, возвраты и сбои по требованию.
#[derive(Default)]
pub struct FakePayments {
    sessions: Mutex<HashMap<String, FakeSession>>,
    refunds: Mutex<Vec<String>>,
    counter: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_refund: AtomicBool,
}

impl FakePayments {
    pub fn session_for(&self, booking_id: Uuid) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .iter()
            .find(|(_, s)| s.booking_id == booking_id)
            .map(|(id, _)| id.clone())
    }

    /// Клиент оплатил на странице провайдера.
    pub fn pay(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.get_mut(session_id).expect("unknown session").paid = true;
    }

    pub fn session(&self, session_id: &str) -> FakeSession {
        self.sessions.lock().unwrap().get(session_id).cloned().expect("unknown session")
    }

    pub fn refunds(&self) -> Vec<String> {
        self.refunds.lock().unwrap().clone()
    }

    fn info(id: &str, s: &FakeSession) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            paid: s.paid,
            payment_ref: s.paid.then(|| format!("pi_{}", id)),
            booking_id: Some(s.booking_id),
        }
    }

    /// Событие вебхука в формате провайдера.
    pub fn event_payload(&self, event_type: &str, session_id: &str) -> Vec<u8> {
        let s = self.session(session_id);
        let payment_status = if s.paid { "paid" } else { "unpaid" };
        let payment_intent = s.paid.then(|| format!("pi_{}", session_id));
        serde_json::json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": event_type,
            "data": { "object": {
                "id": session_id,
                "url": null,
                "payment_status": payment_status,
                "payment_intent": payment_intent,
                "metadata": { "booking_id": s.booking_id.to_string() },
            }},
        })
        .to_string()
        .into_bytes()
    }
}

pub fn sign(payload: &[u8]) -> String {
    signature::sign(payload, WEBHOOK_SECRET, Utc::now().timestamp()).unwrap()
}

#[async_trait]
impl PaymentProvider for FakePayments {
    async fn create_session(&self, request: CheckoutRequest) -> Result<CheckoutSession, PaymentError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PaymentError::Api { status: 503, message: "provider down".into() });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("cs_test_{}", n);
        self.sessions.lock().unwrap().insert(
            id.clone(),
            FakeSession { booking_id: request.booking_id, amount: request.amount(), paid: false, expired: false },
        );
        Ok(CheckoutSession { url: format!("https://pay.test/{}", id), id })
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, PaymentError> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .map(|s| Self::info(session_id, s))
            .ok_or(PaymentError::Api { status: 404, message: "no such session".into() })
    }

    async fn expire_session(&self, session_id: &str) -> Result<(), PaymentError> {
        if let Some(s) = self.sessions.lock().unwrap().get_mut(session_id) {
            s.expired = true;
        }
        Ok(())
    }

    async fn refund(&self, payment_ref: &str) -> Result<RefundReceipt, PaymentError> {
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(PaymentError::Api { status: 500, message: "refund failed".into() });
        }
        self.refunds.lock().unwrap().push(payment_ref.to_string());
        Ok(RefundReceipt { id: format!("re_{}", payment_ref), amount: 0 })
    }

    fn parse_webhook(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent, PaymentError> {
        decode_webhook(payload, signature_header, WEBHOOK_SECRET, Utc::now())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.sent().iter().filter(|n| n.name() == name).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(message.notification.clone());
        Ok(())
    }
}

pub fn booking_config() -> BookingConfig {
    BookingConfig {
        hold_seconds: 600,
        payment_session_ttl_seconds: 1800,
        max_seats_per_booking: 5,
        reminder_lead_seconds: 8 * 3600,
    }
}

pub fn show(id: i64, starts_in: Duration) -> Show {
    Show {
        id,
        movie_id: 10,
        movie_title: "Dune: Part Two".into(),
        theatre_id: Some(1),
        theatre_name: Some("Screen 1".into()),
        show_date_time: Utc::now() + starts_in,
        show_price: SEAT_PRICE,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub payments: Arc<FakePayments>,
    pub scheduler: Arc<MemoryScheduler>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: BookingContext,
    pub reaper: ExpiryReaper,
    pub worker: TaskWorker,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_show(show(SHOW_ID, Duration::days(2)));
        let payments = Arc::new(FakePayments::default());
        let scheduler = Arc::new(MemoryScheduler::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let notifications = NotificationSink::new(notifier.clone());

        let ctx = BookingContext::new(
            store.clone(),
            payments.clone(),
            scheduler.clone(),
            notifications.clone(),
            IdentityVerifier::new(JWT_SECRET, Some("admin@example.com".into())),
            &booking_config(),
            "http://localhost:5173".into(),
        );
        let reaper = ExpiryReaper::new(store.clone(), payments.clone(), ctx.reconciler.clone());
        let worker = TaskWorker::new(
            scheduler.clone(),
            reaper.clone(),
            store.clone(),
            notifications,
            &WorkerConfig { poll_seconds: 1, lease_seconds: 60, batch_size: 50 },
        );

        Self { store, payments, scheduler, notifier, ctx, reaper, worker }
    }

    pub fn request(&self, user: &str, seats: &[&str]) -> ReserveRequest {
        ReserveRequest {
            show_id: SHOW_ID,
            user_id: user.to_string(),
            seats: seats.iter().map(|s| s.to_string()).collect(),
            success_url: "http://localhost:5173/my-bookings?session_id={CHECKOUT_SESSION_ID}".into(),
            cancel_url: "http://localhost:5173/my-bookings".into(),
        }
    }

    pub fn token(&self, user: &str) -> String {
        self.ctx
            .identity
            .issue(&Claims {
                sub: user.to_string(),
                email: None,
                role: None,
                exp: (Utc::now() + Duration::hours(1)).timestamp() as usize,
            })
            .unwrap()
    }

    pub async fn occupied(&self) -> Vec<String> {
        self.store.occupied_seats(SHOW_ID).await.unwrap()
    }
}

/// Уведомления уходят в фоне; даём им доехать.
pub async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
}

pub fn later(minutes: i64) -> DateTime<Utc> {
    Utc::now() + Duration::minutes(minutes)
}

/// Хранилище, у которого не проходит запись суммы возврата.
/// Остальное делегирует обычному `MemoryStore`.
pub struct RefundWriteFails(pub Arc<MemoryStore>);

#[async_trait]
impl BookingStore for RefundWriteFails {
    async fn show(&self, show_id: i64) -> StoreResult<Option<Show>> {
        self.0.show(show_id).await
    }

    async fn occupied_seats(&self, show_id: i64) -> StoreResult<Vec<String>> {
        self.0.occupied_seats(show_id).await
    }

    async fn insert_booking(&self, booking: NewBooking) -> StoreResult<Booking> {
        self.0.insert_booking(booking).await
    }

    async fn booking(&self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        self.0.booking(booking_id).await
    }

    async fn attach_payment_session(&self, booking_id: Uuid, session_id: &str, payment_link: &str) -> StoreResult<()> {
        self.0.attach_payment_session(booking_id, session_id, payment_link).await
    }

    async fn mark_paid(&self, booking_id: Uuid, session_id: &str) -> StoreResult<PaymentTransition> {
        self.0.mark_paid(booking_id, session_id).await
    }

    async fn release_unpaid(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        self.0.release_unpaid(booking_id, at).await
    }

    async fn cancel(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        self.0.cancel(booking_id, at).await
    }

    async fn record_refund(&self, _booking_id: Uuid, _refund_amount: i64) -> StoreResult<()> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn user_bookings(&self, user_id: &str) -> StoreResult<Vec<BookingView>> {
        self.0.user_bookings(user_id).await
    }

    async fn all_bookings(&self) -> StoreResult<Vec<BookingView>> {
        self.0.all_bookings().await
    }
}
