use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Show;

/// Бронь. Сама строка брони и есть удержание мест: отдельной записи "hold" нет.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub user_id: String,
    pub show_id: i64,
    pub booked_seats: Vec<String>,
    pub amount: i64,
    pub is_paid: bool,
    pub is_cancelled: bool,
    /// Ссылка на оплату; очищается после подтверждения или отмены.
    pub payment_link: Option<String>,
    pub payment_session_id: Option<String>,
    pub refund_amount: i64,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Booking {
    /// Активная бронь занимает места (оплаченная или ещё ждущая оплаты).
    pub fn is_active(&self) -> bool {
        !self.is_cancelled
    }

    pub fn status(&self) -> BookingStatus {
        match (self.is_paid, self.is_cancelled) {
            (_, true) => BookingStatus::Cancelled,
            (true, false) => BookingStatus::Paid,
            (false, false) => BookingStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Paid,
    Cancelled,
}

/// Данные для вставки новой брони.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Uuid,
    pub user_id: String,
    pub show_id: i64,
    pub booked_seats: Vec<String>,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Бронь вместе с сеансом, для списков "мои брони" и админки.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub status: BookingStatus,
    pub show: Option<Show>,
}

impl BookingView {
    pub fn new(booking: Booking, show: Option<Show>) -> Self {
        Self {
            status: booking.status(),
            booking,
            show,
        }
    }
}

/// Результат попытки перевести бронь в оплаченное состояние.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentTransition {
    /// Именно этот вызов выполнил переход unpaid -> paid.
    Confirmed(Booking),
    AlreadyPaid(Booking),
    /// Бронь успела освободиться (reaper или отмена) до оплаты.
    Released(Booking),
    NotFound,
}
