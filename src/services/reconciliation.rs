//! Сверка состояния оплаты брони с провайдером.
//!
//! Два независимых входа (синхронная проверка сессии клиентом и
//! подписанный вебхук) сходятся в одном идемпотентном переходе
//! `confirm`. Побочный эффект подтверждения (уведомление, напоминание)
//! выполняет только тот вызов, который реально перевёл бронь в `paid`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BookingError;
use crate::models::{Booking, PaymentTransition};
use crate::services::notifications::{Notification, NotificationSink};
use crate::services::payment::{PaymentError, PaymentProvider, SessionInfo, WebhookEventKind};
use crate::services::scheduler::{Task, TaskScheduler};
use crate::store::BookingStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Confirmed(Booking),
    AlreadyPaid(Booking),
    /// Оплата пришла после освобождения брони; брони не воскрешаются.
    LatePayment { booking: Booking, refunded: bool },
    BookingNotFound,
}

impl ConfirmOutcome {
    pub fn is_paid(&self) -> bool {
        matches!(self, ConfirmOutcome::Confirmed(_) | ConfirmOutcome::AlreadyPaid(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Paid(ConfirmOutcome),
    NotPaid,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    store: Arc<dyn BookingStore>,
    payments: Arc<dyn PaymentProvider>,
    scheduler: Arc<dyn TaskScheduler>,
    notifications: NotificationSink,
    reminder_lead: Duration,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn BookingStore>,
        payments: Arc<dyn PaymentProvider>,
        scheduler: Arc<dyn TaskScheduler>,
        notifications: NotificationSink,
        reminder_lead: Duration,
    ) -> Self {
        Self { store, payments, scheduler, notifications, reminder_lead }
    }

    /// Проверка сессии по запросу клиента (возврат со страницы оплаты).
    pub async fn verify_session(&self, session_id: &str) -> Result<VerifyOutcome, BookingError> {
        if session_id.trim().is_empty() {
            return Err(BookingError::validation("sessionId is required"));
        }

        let session = self.payments.get_session(session_id).await?;
        if !session.paid {
            info!("Session {} is not paid yet", session_id);
            return Ok(VerifyOutcome::NotPaid);
        }

        let Some(booking_id) = session.booking_id else {
            warn!("Paid session {} carries no booking id", session_id);
            return Ok(VerifyOutcome::NotPaid);
        };

        let outcome = self.confirm(booking_id, &session).await?;
        Ok(VerifyOutcome::Paid(outcome))
    }

    /// Обработка вебхука. Подпись проверяется до любых изменений состояния.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let header = signature_header.ok_or(BookingError::SignatureInvalid)?;
        let event = self.payments.parse_webhook(payload, header).map_err(|e| match e {
            PaymentError::Signature(_) => BookingError::SignatureInvalid,
            other => BookingError::validation(other.to_string()),
        })?;

        info!("Payment webhook event {} ({:?})", event.id, event.kind);

        let session = match (&event.kind, event.session) {
            (WebhookEventKind::Other(kind), _) => {
                info!("Unhandled webhook event type: {}", kind);
                return Ok(());
            }
            (_, None) => return Ok(()),
            (_, Some(session)) => session,
        };

        let Some(booking_id) = session.booking_id else {
            warn!("Webhook session {} carries no booking id", session.id);
            return Ok(());
        };

        match event.kind {
            WebhookEventKind::SessionCompleted | WebhookEventKind::AsyncPaymentSucceeded => {
                if session.paid {
                    self.confirm(booking_id, &session).await?;
                } else {
                    // Отложенные способы оплаты завершат сессию позже
                    info!("Session {} completed without payment yet", session.id);
                }
            }
            WebhookEventKind::SessionExpired => {
                if self.store.release_unpaid(booking_id, now).await? {
                    info!("Booking {} released: checkout session {} expired", booking_id, session.id);
                }
            }
            WebhookEventKind::Other(_) => {}
        }

        Ok(())
    }

    /// Идемпотентный переход unpaid -> paid.
    pub async fn confirm(&self, booking_id: Uuid, session: &SessionInfo) -> Result<ConfirmOutcome, BookingError> {
        let outcome = match self.store.mark_paid(booking_id, &session.id).await? {
            PaymentTransition::Confirmed(booking) => {
                info!("Booking {} confirmed by session {}", booking_id, session.id);
                self.after_confirmation(&booking).await;
                ConfirmOutcome::Confirmed(booking)
            }
            PaymentTransition::AlreadyPaid(booking) => ConfirmOutcome::AlreadyPaid(booking),
            PaymentTransition::Released(booking) => {
                warn!("Session {} paid for released booking {}, refunding", session.id, booking_id);
                let refunded = self.refund_late_payment(session).await;
                ConfirmOutcome::LatePayment { booking, refunded }
            }
            PaymentTransition::NotFound => {
                warn!("Booking {} from session {} not found", booking_id, session.id);
                ConfirmOutcome::BookingNotFound
            }
        };
        Ok(outcome)
    }

    async fn after_confirmation(&self, booking: &Booking) {
        let show = match self.store.show(booking.show_id).await {
            Ok(Some(show)) => show,
            Ok(None) => {
                warn!("Show {} of booking {} is gone", booking.show_id, booking.id);
                return;
            }
            Err(e) => {
                warn!("Failed to load show for confirmed booking {}: {}", booking.id, e);
                return;
            }
        };

        self.notifications.emit(Notification::BookingConfirmed {
            booking_id: booking.id,
            user_id: booking.user_id.clone(),
            movie_title: show.movie_title.clone(),
            show_time: show.show_date_time,
            seats: booking.booked_seats.clone(),
            amount: booking.amount,
        });

        let remind_at = show.show_date_time - self.reminder_lead;
        if remind_at > Utc::now() {
            if let Err(e) = self
                .scheduler
                .schedule_at(remind_at, Task::ShowReminder { booking_id: booking.id })
                .await
            {
                warn!("Failed to schedule reminder for booking {}: {}", booking.id, e);
            }
        }
    }

    async fn refund_late_payment(&self, session: &SessionInfo) -> bool {
        let Some(payment_ref) = &session.payment_ref else {
            warn!("Late payment on session {} has no payment reference", session.id);
            return false;
        };
        match self.payments.refund(payment_ref).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Refund of late payment {} failed: {}", payment_ref, e);
                false
            }
        }
    }
}
