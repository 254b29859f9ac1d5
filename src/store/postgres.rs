use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{BookingStore, StoreError, StoreResult};
use crate::database::Database;
use crate::models::{Booking, BookingView, NewBooking, PaymentTransition, Show};

const SHOW_COLUMNS: &str = r#"
    s.id, s.movie_id, m.title AS movie_title, s.theatre_id, t.name AS theatre_name,
    s.show_date_time, s.show_price
    FROM shows s
    JOIN movies m ON m.id = s.movie_id
    LEFT JOIN theatres t ON t.id = s.theatre_id
"#;

const BOOKING_COLUMNS: &str = "id, user_id, show_id, booked_seats, amount, is_paid, is_cancelled, \
     payment_link, payment_session_id, refund_amount, created_at, cancelled_at";

#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn shows_by_ids(&self, ids: &[i64]) -> StoreResult<HashMap<i64, Show>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let shows = sqlx::query_as::<_, Show>(&format!("SELECT {SHOW_COLUMNS} WHERE s.id = ANY($1)"))
            .bind(ids)
            .fetch_all(&self.db.pool)
            .await?;
        Ok(shows.into_iter().map(|s| (s.id, s)).collect())
    }

    // Подтягиваем сеансы одним запросом на весь список
    async fn with_shows(&self, bookings: Vec<Booking>) -> StoreResult<Vec<BookingView>> {
        let mut ids: Vec<i64> = bookings.iter().map(|b| b.show_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let shows = self.shows_by_ids(&ids).await?;

        Ok(bookings
            .into_iter()
            .map(|b| {
                let show = shows.get(&b.show_id).cloned();
                BookingView::new(b, show)
            })
            .collect())
    }

    async fn conditional_cancel(&self, booking_id: Uuid, at: DateTime<Utc>, unpaid_only: bool) -> StoreResult<bool> {
        let mut tx = self.db.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE bookings
            SET is_cancelled = true, cancelled_at = $2, payment_link = NULL
            WHERE id = $1 AND is_cancelled = false AND ($3 = false OR is_paid = false)
            "#,
        )
        .bind(booking_id)
        .bind(at)
        .bind(unpaid_only)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let freed = sqlx::query("DELETE FROM seat_claims WHERE booking_id = $1")
            .bind(booking_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        tracing::debug!("Booking {} cancelled, {} seat claims released", booking_id, freed);
        Ok(true)
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn show(&self, show_id: i64) -> StoreResult<Option<Show>> {
        let show = sqlx::query_as::<_, Show>(&format!("SELECT {SHOW_COLUMNS} WHERE s.id = $1"))
            .bind(show_id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(show)
    }

    async fn occupied_seats(&self, show_id: i64) -> StoreResult<Vec<String>> {
        let seats = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT seat
            FROM bookings, unnest(booked_seats) AS seat
            WHERE show_id = $1 AND is_cancelled = false
            ORDER BY seat
            "#,
        )
        .bind(show_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(seats)
    }

    async fn insert_booking(&self, new: NewBooking) -> StoreResult<Booking> {
        let mut tx = self.db.pool.begin().await?;

        let booking = sqlx::query_as::<_, Booking>(&format!(
            "INSERT INTO bookings (id, user_id, show_id, booked_seats, amount, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(new.id)
        .bind(&new.user_id)
        .bind(new.show_id)
        .bind(&new.booked_seats)
        .bind(new.amount)
        .bind(new.created_at)
        .fetch_one(&mut *tx)
        .await?;

        // Первичный ключ (show_id, seat_label) не даст двум активным броням
        // захватить одно место, даже если обе прошли предварительную проверку.
        // Места захватываются строго по возрастанию метки, иначе две брони
        // с одинаковыми местами в разном порядке ловят deadlock.
        let mut claim_order = new.booked_seats.clone();
        claim_order.sort();
        let claimed: Vec<String> = sqlx::query_scalar(
            r#"
            INSERT INTO seat_claims (show_id, seat_label, booking_id)
            SELECT $1, seat, $3 FROM unnest($2::text[]) AS seat
            ORDER BY seat
            ON CONFLICT (show_id, seat_label) DO NOTHING
            RETURNING seat_label
            "#,
        )
        .bind(new.show_id)
        .bind(&claim_order)
        .bind(new.id)
        .fetch_all(&mut *tx)
        .await?;

        if claimed.len() != new.booked_seats.len() {
            tx.rollback().await?;
            let mut taken: Vec<String> = new
                .booked_seats
                .into_iter()
                .filter(|seat| !claimed.contains(seat))
                .collect();
            taken.sort();
            return Err(StoreError::SeatConflict(taken));
        }

        tx.commit().await?;
        Ok(booking)
    }

    async fn booking(&self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"
        ))
        .bind(booking_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(booking)
    }

    async fn attach_payment_session(
        &self,
        booking_id: Uuid,
        session_id: &str,
        payment_link: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE bookings
            SET payment_session_id = $2, payment_link = $3
            WHERE id = $1 AND is_paid = false AND is_cancelled = false
            "#,
        )
        .bind(booking_id)
        .bind(session_id)
        .bind(payment_link)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn mark_paid(&self, booking_id: Uuid, session_id: &str) -> StoreResult<PaymentTransition> {
        let confirmed = sqlx::query_as::<_, Booking>(&format!(
            "UPDATE bookings
             SET is_paid = true, payment_link = NULL, payment_session_id = $2
             WHERE id = $1 AND is_paid = false AND is_cancelled = false
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(booking_id)
        .bind(session_id)
        .fetch_optional(&self.db.pool)
        .await?;

        if let Some(booking) = confirmed {
            return Ok(PaymentTransition::Confirmed(booking));
        }

        // Переход уже кто-то сделал или бронь освобождена, выясняем, что именно
        Ok(match self.booking(booking_id).await? {
            None => PaymentTransition::NotFound,
            Some(b) if b.is_paid => PaymentTransition::AlreadyPaid(b),
            Some(b) => PaymentTransition::Released(b),
        })
    }

    async fn release_unpaid(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        self.conditional_cancel(booking_id, at, true).await
    }

    async fn cancel(&self, booking_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        self.conditional_cancel(booking_id, at, false).await
    }

    async fn record_refund(&self, booking_id: Uuid, refund_amount: i64) -> StoreResult<()> {
        sqlx::query("UPDATE bookings SET refund_amount = $2 WHERE id = $1 AND is_paid = true")
            .bind(booking_id)
            .bind(refund_amount)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn user_bookings(&self, user_id: &str) -> StoreResult<Vec<BookingView>> {
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;
        self.with_shows(bookings).await
    }

    async fn all_bookings(&self) -> StoreResult<Vec<BookingView>> {
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings ORDER BY created_at DESC"
        ))
        .fetch_all(&self.db.pool)
        .await?;
        self.with_shows(bookings).await
    }
}
