//! In-memory бэкенд для тестов и локального запуска без Postgres.
//!
//! Все операции выполняются под одним мьютексом, поэтому проверка
//! занятости и вставка брони атомарны так же, как уникальный ключ
//! `seat_claims` в Postgres.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{BookingStore, StoreError, StoreResult};
use crate::models::{Booking, BookingView, NewBooking, PaymentTransition, Show};

#[derive(Default)]
struct Inner {
    shows: HashMap<i64, Show>,
    bookings: HashMap<Uuid, Booking>,
    // (show_id, seat) -> booking_id, только для активных броней
    claims: HashMap<(i64, String), Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_show(&self, show: Show) {
        self.lock().shows.insert(show.id, show);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn view(inner: &Inner, booking: &Booking) -> BookingView {
        BookingView::new(booking.clone(), inner.shows.get(&booking.show_id).cloned())
    }

    fn release_claims(inner: &mut Inner, booking_id: Uuid) {
        inner.claims.retain(|_, owner| *owner != booking_id);
    }

    fn sorted_views<'a>(inner: &Inner, bookings: impl Iterator<Item = &'a Booking>) -> Vec<BookingView> {
        let mut views: Vec<BookingView> = bookings.map(|b| Self::view(inner, b)).collect();
        views.sort_by(|a, b| b.booking.created_at.cmp(&a.booking.created_at));
        views
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn show(&self, show_id: i64) -> StoreResult<Option<Show>> {
        Ok(self.lock().shows.get(&show_id).cloned())
    }

    async fn occupied_seats(&self, show_id: i64) -> StoreResult<Vec<String>> {
        let inner = self.lock();
        let seats: BTreeSet<String> = inner
            .bookings
            .values()
            .filter(|b| b.show_id == show_id && b.is_active())
            .flat_map(|b| b.booked_seats.iter().cloned())
            .collect();
        Ok(seats.into_iter().collect())
    }

    async fn insert_booking(&self, new: NewBooking) -> StoreResult<Booking> {
        let mut inner = self.lock();

        let mut taken: Vec<String> = new
            .booked_seats
            .iter()
            .filter(|seat| inner.claims.contains_key(&(new.show_id, (*seat).clone())))
            .cloned()
            .collect();
        if !taken.is_empty() {
            taken.sort();
            return Err(StoreError::SeatConflict(taken));
        }

        for seat in &new.booked_seats {
            inner.claims.insert((new.show_id, seat.clone()), new.id);
        }

        let booking = Booking {
            id: new.id,
            user_id: new.user_id,
            show_id: new.show_id,
            booked_seats: new.booked_seats,
            amount: new.amount,
            is_paid: false,
            is_cancelled: false,
            payment_link: None,
            payment_session_id: None,
            refund_amount: 0,
            created_at: new.created_at,
            cancelled_at: None,
        };
        inner.bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn booking(&self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        Ok(self.lock().bookings.get(&booking_id).cloned())
    }

    async fn attach_payment_session(
        &self,
        booking_id: Uuid,
        session_id: &str,
        payment_link: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(booking) = inner.bookings.get_mut(&booking_id) {
            if !booking.is_paid && !booking.is_cancelled {
                booking.payment_session_id = Some(session_id.to_string());
                booking.payment_link = Some(payment_link.to_string());
            }
        }
        Ok(())
    }

    async fn mark_paid(&self, booking_id: Uuid, session_id: &str) -> StoreResult<PaymentTransition> {
        let mut inner = self.lock();
        let Some(booking) = inner.bookings.get_mut(&booking_id) else {
            return Ok(PaymentTransition::NotFound);
        };

        if booking.is_paid {
            return Ok(PaymentTransition::AlreadyPaid(booking.clone()));
        }
        if booking.is_cancelled {
            return Ok(PaymentTransition::Released(booking.clone()));
        }

        booking.is_paid = true;
        booking.payment_link = None;
        booking.payment_session_id = Some(session_id.to_string());
        Ok(PaymentTransition::Confirmed(booking.clone()))
    }

    async fn release_unpaid(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let released = match inner.bookings.get_mut(&booking_id) {
            Some(booking) if !booking.is_paid && !booking.is_cancelled => {
                booking.is_cancelled = true;
                booking.cancelled_at = Some(at);
                booking.payment_link = None;
                true
            }
            _ => false,
        };
        if released {
            Self::release_claims(&mut inner, booking_id);
        }
        Ok(released)
    }

    async fn cancel(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let cancelled = match inner.bookings.get_mut(&booking_id) {
            Some(booking) if !booking.is_cancelled => {
                booking.is_cancelled = true;
                booking.cancelled_at = Some(at);
                booking.payment_link = None;
                true
            }
            _ => false,
        };
        if cancelled {
            Self::release_claims(&mut inner, booking_id);
        }
        Ok(cancelled)
    }

    async fn record_refund(&self, booking_id: Uuid, refund_amount: i64) -> StoreResult<()> {
        if let Some(booking) = self.lock().bookings.get_mut(&booking_id) {
            booking.refund_amount = refund_amount;
        }
        Ok(())
    }

    async fn user_bookings(&self, user_id: &str) -> StoreResult<Vec<BookingView>> {
        let inner = self.lock();
        let views = Self::sorted_views(&inner, inner.bookings.values().filter(|b| b.user_id == user_id));
        Ok(views)
    }

    async fn all_bookings(&self) -> StoreResult<Vec<BookingView>> {
        let inner = self.lock();
        let views = Self::sorted_views(&inner, inner.bookings.values());
        Ok(views)
    }
}
