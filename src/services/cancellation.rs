//! Отмена брони пользователем с возвратом средств, если бронь оплачена.
//!
//! Сначала бронь условно помечается отменённой (места освобождаются),
//! и только выигравший эту отметку вызов делает возврат. Так двойная
//! отмена не приводит к двойному возврату. Сбой возврата отмену не
//! блокирует.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::BookingError;
use crate::models::Booking;
use crate::services::notifications::{Notification, NotificationSink};
use crate::services::payment::PaymentProvider;
use crate::store::BookingStore;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub booking_id: Uuid,
    pub refunded: bool,
    pub refund_amount: i64,
}

#[derive(Clone)]
pub struct CancellationService {
    store: Arc<dyn BookingStore>,
    payments: Arc<dyn PaymentProvider>,
    notifications: NotificationSink,
}

impl CancellationService {
    pub fn new(store: Arc<dyn BookingStore>, payments: Arc<dyn PaymentProvider>, notifications: NotificationSink) -> Self {
        Self { store, payments, notifications }
    }

    pub async fn cancel(
        &self,
        booking_id: Uuid,
        requesting_user: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, BookingError> {
        let booking = self
            .store
            .booking(booking_id)
            .await?
            .ok_or(BookingError::NotFound("booking"))?;

        if booking.user_id != requesting_user {
            warn!("User {} tried to cancel booking {} of another user", requesting_user, booking_id);
            return Err(BookingError::Unauthorized);
        }
        if booking.is_cancelled {
            return Err(BookingError::validation("booking is already cancelled"));
        }

        if !self.store.cancel(booking_id, now).await? {
            return Err(BookingError::validation("booking is already cancelled"));
        }

        // Статус оплаты перечитываем после отмены: оплата могла пройти
        // между чтением и отменой
        let booking = self.store.booking(booking_id).await?.unwrap_or(booking);

        let (refunded, refund_amount) = if booking.is_paid {
            self.refund(&booking).await
        } else {
            (false, 0)
        };
        // Деньги уже вернули: сбой записи не отменяет ни ответ, ни уведомление
        if refunded {
            if let Err(e) = self.store.record_refund(booking_id, refund_amount).await {
                error!(
                    "Refund of {} for booking {} issued but not recorded: {}",
                    refund_amount, booking_id, e
                );
            }
        }

        info!(
            "Booking {} cancelled by owner (paid={}, refunded={}, amount={})",
            booking_id, booking.is_paid, refunded, refund_amount
        );

        self.notify(&booking, refunded, refund_amount).await;

        Ok(CancelOutcome { booking_id, refunded, refund_amount })
    }

    async fn refund(&self, booking: &Booking) -> (bool, i64) {
        let Some(session_id) = booking.payment_session_id.as_deref() else {
            warn!("Paid booking {} has no payment session, skipping refund", booking.id);
            return (false, 0);
        };

        let payment_ref = match self.payments.get_session(session_id).await {
            Ok(session) => session.payment_ref,
            Err(e) => {
                warn!("Failed to load session {} for refund: {}", session_id, e);
                return (false, 0);
            }
        };
        let Some(payment_ref) = payment_ref else {
            warn!("Session {} has no payment instrument to refund", session_id);
            return (false, 0);
        };

        match self.payments.refund(&payment_ref).await {
            Ok(_) => (true, booking.amount),
            Err(e) => {
                warn!("Refund for booking {} failed: {}", booking.id, e);
                (false, 0)
            }
        }
    }

    async fn notify(&self, booking: &Booking, refunded: bool, refund_amount: i64) {
        let show = match self.store.show(booking.show_id).await {
            Ok(Some(show)) => show,
            _ => {
                warn!("Show {} not found, skipping cancellation notice", booking.show_id);
                return;
            }
        };

        self.notifications.emit(Notification::BookingCancelled {
            booking_id: booking.id,
            user_id: booking.user_id.clone(),
            movie_title: show.movie_title,
            show_time: show.show_date_time,
            seats: booking.booked_seats.clone(),
            refunded,
            refund_amount,
        });
    }
}
