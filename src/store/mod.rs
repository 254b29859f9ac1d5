//! Хранилище броней: единственный источник истины о занятости мест.
//!
//! Занятость не хранится отдельно: это все `booked_seats` активных
//! (не отменённых) броней сеанса. Гонку "проверили, потом вставили" закрывает
//! сам бэкенд: вставка брони атомарно захватывает пары (сеанс, место),
//! и проигравший конкурентный запрос получает `StoreError::SeatConflict`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Booking, BookingView, NewBooking, PaymentTransition, Show};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("seats already taken: {0:?}")]
    SeatConflict(Vec<String>),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn show(&self, show_id: i64) -> StoreResult<Option<Show>>;

    /// Места, занятые активными бронями сеанса, в отсортированном виде.
    async fn occupied_seats(&self, show_id: i64) -> StoreResult<Vec<String>>;

    /// Создаёт неоплаченную бронь и атомарно захватывает её места.
    async fn insert_booking(&self, booking: NewBooking) -> StoreResult<Booking>;

    async fn booking(&self, booking_id: Uuid) -> StoreResult<Option<Booking>>;

    async fn attach_payment_session(
        &self,
        booking_id: Uuid,
        session_id: &str,
        payment_link: &str,
    ) -> StoreResult<()>;

    /// Условный переход unpaid -> paid: выигрывает только первый вызов.
    async fn mark_paid(&self, booking_id: Uuid, session_id: &str) -> StoreResult<PaymentTransition>;

    /// Отменяет бронь, только если она ещё не оплачена и не отменена.
    /// Возвращает `true`, если места были освобождены этим вызовом.
    async fn release_unpaid(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Отменяет активную бронь (оплаченную или нет) и освобождает места.
    async fn cancel(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    async fn record_refund(&self, booking_id: Uuid, refund_amount: i64) -> StoreResult<()>;

    /// Брони пользователя, новые сверху.
    async fn user_bookings(&self, user_id: &str) -> StoreResult<Vec<BookingView>>;

    async fn all_bookings(&self) -> StoreResult<Vec<BookingView>>;
}
