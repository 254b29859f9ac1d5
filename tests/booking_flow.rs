mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};

use common::{later, settle, show, sign, Harness, RefundWriteFails, SEAT_PRICE};
use showtime_booking::error::BookingError;
use showtime_booking::models::BookingStatus;
use showtime_booking::services::cancellation::CancellationService;
use showtime_booking::services::notifications::NotificationSink;
use showtime_booking::services::reaper::ReapOutcome;
use showtime_booking::services::reconciliation::{ConfirmOutcome, VerifyOutcome};
use showtime_booking::services::scheduler::Task;
use showtime_booking::store::BookingStore;

#[tokio::test]
async fn seats_stay_taken_until_released() {
    let h = Harness::new();
    let now = Utc::now();

    let first = h.ctx.reservations.reserve(h.request("alice", &["A1", "A2"]), now).await.unwrap();
    assert_eq!(first.amount, 2 * SEAT_PRICE);
    assert!(first.payment_url.starts_with("https://pay.test/"));

    let err = h.ctx.reservations.reserve(h.request("bob", &["A2", "A3"]), now).await.unwrap_err();
    assert!(matches!(err, BookingError::SeatConflict(ref seats) if seats == &vec!["A2".to_string()]));

    // оплата ничего не меняет в занятости
    let session = h.payments.session_for(first.booking_id).unwrap();
    h.payments.pay(&session);
    h.ctx.reconciler.verify_session(&session).await.unwrap();
    assert!(h.ctx.reservations.reserve(h.request("bob", &["A2", "A3"]), now).await.is_err());

    h.ctx.reservations.reserve(h.request("bob", &["A3"]), now).await.unwrap();
    assert_eq!(h.occupied().await, vec!["A1", "A2", "A3"]);
}

#[tokio::test]
async fn reservation_schedules_release_at_hold_deadline() {
    let h = Harness::new();
    let now = Utc::now();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["B1"]), now).await.unwrap();

    assert_eq!(reservation.release_at, now + Duration::minutes(10));
    let pending = h.scheduler.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task, Task::ReleaseUnpaidBooking { booking_id: reservation.booking_id });
    assert_eq!(pending[0].run_at, reservation.release_at);

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status(), BookingStatus::Pending);
    assert_eq!(booking.payment_link.as_deref(), Some(reservation.payment_url.as_str()));
}

#[tokio::test]
async fn unpaid_booking_is_released_by_worker() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["C1", "C2"]), Utc::now()).await.unwrap();

    // до истечения удержания ничего не происходит
    assert_eq!(h.worker.run_due(later(5)).await, 0);
    assert_eq!(h.occupied().await, vec!["C1", "C2"]);

    assert_eq!(h.worker.run_due(later(11)).await, 1);
    assert!(h.occupied().await.is_empty());

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert!(booking.is_cancelled);
    assert!(booking.payment_link.is_none());

    let session = h.payments.session_for(reservation.booking_id).unwrap();
    assert!(h.payments.session(&session).expired);
    assert!(h.scheduler.pending().is_empty());

    // места снова можно забронировать
    h.ctx.reservations.reserve(h.request("bob", &["C1"]), later(12)).await.unwrap();
}

#[tokio::test]
async fn reaper_run_twice_is_harmless() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["D1"]), Utc::now()).await.unwrap();

    let first = h.reaper.release_if_unpaid(reservation.booking_id, later(10)).await.unwrap();
    let second = h.reaper.release_if_unpaid(reservation.booking_id, later(11)).await.unwrap();
    assert_eq!(first, ReapOutcome::Released);
    assert_eq!(second, ReapOutcome::Gone);
}

#[tokio::test]
async fn reaper_confirms_payment_missed_by_webhook() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["E1"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();
    h.payments.pay(&session);

    let outcome = h.reaper.release_if_unpaid(reservation.booking_id, later(10)).await.unwrap();
    assert_eq!(outcome, ReapOutcome::ConfirmedLate);

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status(), BookingStatus::Paid);
    assert_eq!(h.occupied().await, vec!["E1"]);

    settle().await;
    assert_eq!(h.notifier.count("booking_confirmed"), 1);
}

#[tokio::test]
async fn webhook_and_verify_confirm_once() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["F1", "F2"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();
    h.payments.pay(&session);

    let payload = h.payments.event_payload("checkout.session.completed", &session);
    h.ctx.reconciler.handle_webhook(&payload, Some(&sign(&payload)), Utc::now()).await.unwrap();
    // провайдер повторил доставку
    h.ctx.reconciler.handle_webhook(&payload, Some(&sign(&payload)), Utc::now()).await.unwrap();

    let verified = h.ctx.reconciler.verify_session(&session).await.unwrap();
    assert!(matches!(verified, VerifyOutcome::Paid(ConfirmOutcome::AlreadyPaid(_))));

    settle().await;
    assert_eq!(h.notifier.count("booking_confirmed"), 1);

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert!(booking.is_paid);
    assert!(booking.payment_link.is_none());

    // напоминание запланировано ровно одно
    let reminders = h
        .scheduler
        .pending()
        .into_iter()
        .filter(|t| matches!(t.task, Task::ShowReminder { .. }))
        .count();
    assert_eq!(reminders, 1);
}

#[tokio::test]
async fn unpaid_session_is_not_verified() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["G1"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();

    assert_eq!(h.ctx.reconciler.verify_session(&session).await.unwrap(), VerifyOutcome::NotPaid);

    let payload = h.payments.event_payload("checkout.session.completed", &session);
    h.ctx.reconciler.handle_webhook(&payload, Some(&sign(&payload)), Utc::now()).await.unwrap();
    assert!(!h.store.booking(reservation.booking_id).await.unwrap().unwrap().is_paid);
}

#[tokio::test]
async fn forged_webhook_changes_nothing() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["H1"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();
    h.payments.pay(&session);

    let payload = h.payments.event_payload("checkout.session.completed", &session);
    let forged = showtime_booking::services::signature::sign(&payload, "wrong_secret", Utc::now().timestamp()).unwrap();

    let err = h.ctx.reconciler.handle_webhook(&payload, Some(&forged), Utc::now()).await.unwrap_err();
    assert!(matches!(err, BookingError::SignatureInvalid));
    let err = h.ctx.reconciler.handle_webhook(&payload, None, Utc::now()).await.unwrap_err();
    assert!(matches!(err, BookingError::SignatureInvalid));

    assert!(!h.store.booking(reservation.booking_id).await.unwrap().unwrap().is_paid);
}

#[tokio::test]
async fn expired_session_event_releases_seats() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["J1"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();

    let payload = h.payments.event_payload("checkout.session.expired", &session);
    h.ctx.reconciler.handle_webhook(&payload, Some(&sign(&payload)), Utc::now()).await.unwrap();

    assert!(h.occupied().await.is_empty());
    assert!(h.store.booking(reservation.booking_id).await.unwrap().unwrap().is_cancelled);
}

#[tokio::test]
async fn payment_after_release_is_refunded_not_resurrected() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["K1"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();
    h.worker.run_due(later(11)).await;

    // кто-то другой уже занял место
    h.ctx.reservations.reserve(h.request("bob", &["K1"]), later(12)).await.unwrap();

    h.payments.pay(&session);
    let outcome = h.ctx.reconciler.verify_session(&session).await.unwrap();
    assert!(matches!(outcome, VerifyOutcome::Paid(ConfirmOutcome::LatePayment { refunded: true, .. })));
    assert_eq!(h.payments.refunds(), vec![format!("pi_{}", session)]);

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert!(booking.is_cancelled);
    assert!(!booking.is_paid);
    assert_eq!(h.occupied().await, vec!["K1"]);
}

#[tokio::test]
async fn provider_outage_leaves_booking_for_the_reaper() {
    let h = Harness::new();
    h.payments.fail_create.store(true, Ordering::SeqCst);

    let err = h.ctx.reservations.reserve(h.request("alice", &["L1"]), Utc::now()).await.unwrap_err();
    assert!(matches!(err, BookingError::PaymentProvider(_)));
    assert_eq!(h.occupied().await, vec!["L1"]);

    assert_eq!(h.worker.run_due(later(11)).await, 1);
    assert!(h.occupied().await.is_empty());
}

#[tokio::test]
async fn paid_booking_cancel_refunds_and_frees_seats() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["M1", "M2"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();
    h.payments.pay(&session);
    h.ctx.reconciler.verify_session(&session).await.unwrap();

    let outcome = h.ctx.cancellations.cancel(reservation.booking_id, "alice", Utc::now()).await.unwrap();
    assert!(outcome.refunded);
    assert_eq!(outcome.refund_amount, 2 * SEAT_PRICE);

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status(), BookingStatus::Cancelled);
    assert_eq!(booking.refund_amount, 2 * SEAT_PRICE);
    assert!(h.occupied().await.is_empty());

    settle().await;
    assert_eq!(h.notifier.count("booking_cancelled"), 1);
}

#[tokio::test]
async fn failed_refund_still_cancels() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["N1"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();
    h.payments.pay(&session);
    h.ctx.reconciler.verify_session(&session).await.unwrap();
    h.payments.fail_refund.store(true, Ordering::SeqCst);

    let outcome = h.ctx.cancellations.cancel(reservation.booking_id, "alice", Utc::now()).await.unwrap();
    assert!(!outcome.refunded);
    assert_eq!(outcome.refund_amount, 0);

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert!(booking.is_cancelled);
    assert_eq!(booking.refund_amount, 0);
    assert!(h.occupied().await.is_empty());
}

#[tokio::test]
async fn unrecorded_refund_still_reports_and_notifies() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["N2"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(reservation.booking_id).unwrap();
    h.payments.pay(&session);
    h.ctx.reconciler.verify_session(&session).await.unwrap();
    settle().await;

    let cancellations = CancellationService::new(
        std::sync::Arc::new(RefundWriteFails(h.store.clone())),
        h.payments.clone(),
        NotificationSink::new(h.notifier.clone()),
    );
    let outcome = cancellations.cancel(reservation.booking_id, "alice", Utc::now()).await.unwrap();
    assert!(outcome.refunded);
    assert_eq!(outcome.refund_amount, SEAT_PRICE);
    assert_eq!(h.payments.refunds().len(), 1);

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert!(booking.is_cancelled);
    assert!(h.occupied().await.is_empty());

    settle().await;
    assert_eq!(h.notifier.count("booking_cancelled"), 1);
}

#[tokio::test]
async fn unpaid_cancel_needs_no_refund() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["P1"]), Utc::now()).await.unwrap();

    let outcome = h.ctx.cancellations.cancel(reservation.booking_id, "alice", Utc::now()).await.unwrap();
    assert!(!outcome.refunded);
    assert!(h.payments.refunds().is_empty());

    let again = h.ctx.cancellations.cancel(reservation.booking_id, "alice", Utc::now()).await.unwrap_err();
    assert!(matches!(again, BookingError::Validation(_)));
}

#[tokio::test]
async fn strangers_cannot_cancel() {
    let h = Harness::new();
    let reservation = h.ctx.reservations.reserve(h.request("alice", &["Q1"]), Utc::now()).await.unwrap();

    let err = h.ctx.cancellations.cancel(reservation.booking_id, "mallory", Utc::now()).await.unwrap_err();
    assert!(matches!(err, BookingError::Unauthorized));

    let booking = h.store.booking(reservation.booking_id).await.unwrap().unwrap();
    assert!(!booking.is_cancelled);
    assert_eq!(h.occupied().await, vec!["Q1"]);

    let missing = h.ctx.cancellations.cancel(uuid::Uuid::new_v4(), "alice", Utc::now()).await.unwrap_err();
    assert!(matches!(missing, BookingError::NotFound(_)));
}

#[tokio::test]
async fn paid_booking_gets_show_reminder() {
    let h = Harness::new();
    let paid = h.ctx.reservations.reserve(h.request("alice", &["R1"]), Utc::now()).await.unwrap();
    let session = h.payments.session_for(paid.booking_id).unwrap();
    h.payments.pay(&session);
    h.ctx.reconciler.verify_session(&session).await.unwrap();

    // к моменту напоминания (за 8 часов до сеанса) обе задачи созрели
    let done = h.worker.run_due(Utc::now() + Duration::hours(41)).await;
    assert_eq!(done, 2);

    settle().await;
    assert_eq!(h.notifier.count("show_reminder"), 1);
    assert!(h.scheduler.pending().is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_write() {
    let h = Harness::new();
    h.store.insert_show(show(2, -Duration::hours(1)));
    let now = Utc::now();

    let too_many = h.request("alice", &["A1", "A2", "A3", "A4", "A5", "A6"]);
    assert!(matches!(h.ctx.reservations.reserve(too_many, now).await, Err(BookingError::Validation(_))));

    let mut started = h.request("alice", &["A1"]);
    started.show_id = 2;
    assert!(matches!(h.ctx.reservations.reserve(started, now).await, Err(BookingError::Validation(_))));

    let mut unknown = h.request("alice", &["A1"]);
    unknown.show_id = 999;
    assert!(matches!(h.ctx.reservations.reserve(unknown, now).await, Err(BookingError::NotFound(_))));

    let anonymous = h.request("", &["A1"]);
    assert!(matches!(h.ctx.reservations.reserve(anonymous, now).await, Err(BookingError::Unauthenticated)));

    assert!(h.store.all_bookings().await.unwrap().is_empty());
    assert!(h.scheduler.pending().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_seat_have_one_winner() {
    let h = Harness::new();
    let now = Utc::now();

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = h.ctx.reservations.clone();
        let request = h.request(&format!("user_{}", i), &["S1", &format!("T{}", i)]);
        handles.push(tokio::spawn(async move { service.reserve(request, now).await }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(BookingError::SeatConflict(seats)) => assert_eq!(seats, vec!["S1".to_string()]),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);

    let occupied = h.occupied().await;
    assert_eq!(occupied.iter().filter(|s| s.as_str() == "S1").count(), 1);
    assert_eq!(occupied.len(), 2);
}
