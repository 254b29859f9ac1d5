pub mod cache;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod services;
pub mod store;

use std::sync::Arc;

use axum::extract::FromRef;

use middleware::IdentityVerifier;
use services::{
    cancellation::CancellationService,
    notifications::NotificationSink,
    payment::PaymentProvider,
    reconciliation::PaymentReconciler,
    reservation::{ReservationPolicy, ReservationService},
    scheduler::TaskScheduler,
};
use store::BookingStore;

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub db: database::Database,
    pub redis: redis_client::RedisClient,
    pub cache: cache::CacheService,
    pub booking: BookingContext,
}

/// Всё, что нужно маршрутам бронирования и вебхуку.
/// Не зависит от конкретных бэкендов, поэтому собирается и в тестах.
#[derive(Clone)]
pub struct BookingContext {
    pub reservations: ReservationService,
    pub reconciler: PaymentReconciler,
    pub cancellations: CancellationService,
    pub store: Arc<dyn BookingStore>,
    pub identity: IdentityVerifier,
    pub notifications: NotificationSink,
    /// Куда вернуть пользователя после оплаты, если нет заголовка Origin
    pub frontend_url: String,
}

impl BookingContext {
    /// Собирает сервисы бронирования поверх заданных бэкендов.
    pub fn new(
        store: Arc<dyn BookingStore>,
        payments: Arc<dyn PaymentProvider>,
        scheduler: Arc<dyn TaskScheduler>,
        notifications: NotificationSink,
        identity: IdentityVerifier,
        booking: &config::BookingConfig,
        frontend_url: String,
    ) -> Self {
        let reconciler = PaymentReconciler::new(
            store.clone(),
            payments.clone(),
            scheduler.clone(),
            notifications.clone(),
            chrono::Duration::seconds(booking.reminder_lead_seconds),
        );
        Self {
            reservations: ReservationService::new(
                store.clone(),
                payments.clone(),
                scheduler,
                ReservationPolicy::from(booking),
            ),
            reconciler,
            cancellations: CancellationService::new(store.clone(), payments, notifications.clone()),
            store,
            identity,
            notifications,
            frontend_url,
        }
    }
}

impl FromRef<BookingContext> for IdentityVerifier {
    fn from_ref(ctx: &BookingContext) -> Self {
        ctx.identity.clone()
    }
}

impl FromRef<Arc<AppState>> for IdentityVerifier {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.booking.identity.clone()
    }
}

impl FromRef<Arc<AppState>> for BookingContext {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.booking.clone()
    }
}
