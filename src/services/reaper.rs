use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BookingError;
use crate::services::payment::PaymentProvider;
use crate::services::reconciliation::PaymentReconciler;
use crate::store::BookingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    Released,
    /// Последняя проверка у провайдера показала, что бронь оплачена.
    ConfirmedLate,
    AlreadyPaid,
    /// Брони нет или она уже отменена.
    Gone,
}

/// Освобождает брони, не оплаченные за время удержания.
/// Повторный запуск для той же брони безопасен.
#[derive(Clone)]
pub struct ExpiryReaper {
    store: Arc<dyn BookingStore>,
    payments: Arc<dyn PaymentProvider>,
    reconciler: PaymentReconciler,
}

impl ExpiryReaper {
    pub fn new(store: Arc<dyn BookingStore>, payments: Arc<dyn PaymentProvider>, reconciler: PaymentReconciler) -> Self {
        Self { store, payments, reconciler }
    }

    pub async fn release_if_unpaid(&self, booking_id: Uuid, now: DateTime<Utc>) -> Result<ReapOutcome, BookingError> {
        let Some(booking) = self.store.booking(booking_id).await? else {
            return Ok(ReapOutcome::Gone);
        };
        if booking.is_paid {
            return Ok(ReapOutcome::AlreadyPaid);
        }
        if booking.is_cancelled {
            return Ok(ReapOutcome::Gone);
        }

        if let Some(session_id) = booking.payment_session_id.as_deref() {
            // Перед освобождением последний раз спрашиваем провайдера:
            // вебхук мог потеряться, а оплата пройти
            match self.payments.get_session(session_id).await {
                Ok(session) if session.paid => {
                    info!("Booking {} was paid during hold, confirming instead of releasing", booking_id);
                    let outcome = self.reconciler.confirm(booking_id, &session).await?;
                    if outcome.is_paid() {
                        return Ok(ReapOutcome::ConfirmedLate);
                    }
                    return Ok(ReapOutcome::Gone);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Could not check session {} before release, proceeding: {}", session_id, e);
                }
            }

            // Закрываем сессию, чтобы по ней нельзя было оплатить освобождённые места
            if let Err(e) = self.payments.expire_session(session_id).await {
                warn!("Failed to expire session {}: {}", session_id, e);
            }
        }

        if self.store.release_unpaid(booking_id, now).await? {
            info!("Booking {} released after hold timeout, seats {:?} are free", booking_id, booking.booked_seats);
            Ok(ReapOutcome::Released)
        } else {
            // Между чтением и обновлением бронь успели оплатить или отменить
            Ok(ReapOutcome::Gone)
        }
    }
}
