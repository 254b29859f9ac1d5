pub mod admin;
pub mod bookings;
pub mod payment;
pub mod shows;
pub mod user;

use axum::Router;
use std::sync::Arc;

use crate::{AppState, BookingContext};

/// Маршруты бронирования и вебхука работают только с `BookingContext`.
pub fn booking_routes<S>(ctx: BookingContext) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .merge(bookings::routes())
        .merge(payment::routes())
        .with_state(ctx)
}

pub fn routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(shows::routes())
        .merge(user::routes())
        .merge(admin::routes())
        .merge(booking_routes(state.booking.clone()))
}
