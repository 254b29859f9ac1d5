//! Резервирование мест и создание сессии оплаты.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BookingConfig;
use crate::error::BookingError;
use crate::models::NewBooking;
use crate::services::payment::{CheckoutRequest, PaymentProvider};
use crate::services::scheduler::{Task, TaskScheduler};
use crate::store::BookingStore;

const MAX_SEAT_LABEL_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub show_id: i64,
    pub user_id: String,
    pub seats: Vec<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub booking_id: Uuid,
    pub amount: i64,
    pub payment_url: String,
    pub release_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReservationPolicy {
    /// Через сколько неоплаченная бронь освобождается.
    pub hold: Duration,
    /// Время жизни сессии оплаты у провайдера; должно быть больше `hold`.
    pub session_ttl: Duration,
    pub max_seats: usize,
}

impl From<&BookingConfig> for ReservationPolicy {
    fn from(config: &BookingConfig) -> Self {
        Self {
            hold: Duration::seconds(config.hold_seconds),
            session_ttl: Duration::seconds(config.payment_session_ttl_seconds),
            max_seats: config.max_seats_per_booking,
        }
    }
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            hold: Duration::minutes(10),
            session_ttl: Duration::minutes(30),
            max_seats: 5,
        }
    }
}

#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn BookingStore>,
    payments: Arc<dyn PaymentProvider>,
    scheduler: Arc<dyn TaskScheduler>,
    policy: ReservationPolicy,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        payments: Arc<dyn PaymentProvider>,
        scheduler: Arc<dyn TaskScheduler>,
        policy: ReservationPolicy,
    ) -> Self {
        Self { store, payments, scheduler, policy }
    }

    pub async fn reserve(&self, request: ReserveRequest, now: DateTime<Utc>) -> Result<Reservation, BookingError> {
        if request.user_id.trim().is_empty() {
            return Err(BookingError::Unauthenticated);
        }
        let seats = normalize_seats(&request.seats, self.policy.max_seats)?;

        // Быстрая проверка по текущей занятости. Окончательно конфликт
        // решает вставка брони, захватывающая места атомарно.
        let occupied: HashSet<String> = self.store.occupied_seats(request.show_id).await?.into_iter().collect();
        let mut taken: Vec<String> = seats.iter().filter(|s| occupied.contains(*s)).cloned().collect();
        if !taken.is_empty() {
            taken.sort();
            return Err(BookingError::SeatConflict(taken));
        }

        let show = self
            .store
            .show(request.show_id)
            .await?
            .ok_or(BookingError::NotFound("show"))?;
        if show.has_started(now) {
            return Err(BookingError::validation("show has already started"));
        }

        let booking = self
            .store
            .insert_booking(NewBooking {
                id: Uuid::new_v4(),
                user_id: request.user_id.clone(),
                show_id: show.id,
                amount: show.show_price * seats.len() as i64,
                booked_seats: seats,
                created_at: now,
            })
            .await?;

        // Reaper планируем сразу после вставки: если провайдер оплаты
        // упадёт, брошенную бронь всё равно освободят
        let release_at = booking.created_at + self.policy.hold;
        if let Err(e) = self
            .scheduler
            .schedule_at(release_at, Task::ReleaseUnpaidBooking { booking_id: booking.id })
            .await
        {
            error!("Failed to schedule release of booking {}: {}", booking.id, e);
            if let Err(release_err) = self.store.release_unpaid(booking.id, now).await {
                error!("Failed to release unscheduled booking {}: {}", booking.id, release_err);
            }
            return Err(e.into());
        }

        let session = self
            .payments
            .create_session(CheckoutRequest {
                booking_id: booking.id,
                description: format!("Booking for {}", show.movie_title),
                unit_amount: show.show_price,
                quantity: booking.booked_seats.len() as u32,
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                expires_at: now + self.policy.session_ttl,
            })
            .await
            .map_err(|e| {
                warn!("Checkout session for booking {} failed, left for reaper: {}", booking.id, e);
                BookingError::PaymentProvider(e)
            })?;

        self.store
            .attach_payment_session(booking.id, &session.id, &session.url)
            .await?;

        info!(
            "Booking {} reserved seats {:?} of show {} for user {}, release at {}",
            booking.id, booking.booked_seats, show.id, booking.user_id, release_at
        );

        Ok(Reservation {
            booking_id: booking.id,
            amount: booking.amount,
            payment_url: session.url,
            release_at,
        })
    }
}

/// Приводит метки мест к виду `A1`: обрезает пробелы, верхний регистр,
/// проверяет формат, лимит и отсутствие повторов. Результат отсортирован.
pub fn normalize_seats(seats: &[String], max_seats: usize) -> Result<Vec<String>, BookingError> {
    if seats.is_empty() {
        return Err(BookingError::validation("at least one seat must be selected"));
    }
    if seats.len() > max_seats {
        return Err(BookingError::validation(format!(
            "no more than {} seats can be booked at once",
            max_seats
        )));
    }

    let mut seen = HashSet::with_capacity(seats.len());
    let mut normalized = Vec::with_capacity(seats.len());
    for raw in seats {
        let seat = raw.trim().to_uppercase();
        if seat.is_empty() || seat.len() > MAX_SEAT_LABEL_LEN || !seat.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BookingError::validation(format!("invalid seat label '{}'", raw)));
        }
        if !seen.insert(seat.clone()) {
            return Err(BookingError::validation(format!("seat {} selected twice", seat)));
        }
        normalized.push(seat);
    }
    // Единый порядок мест: конкурентные брони захватывают их в одной последовательности
    normalized.sort();
    Ok(normalized)
}
