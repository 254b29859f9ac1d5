pub mod booking;
pub mod movie;
pub mod show;

pub use booking::{Booking, BookingStatus, BookingView, NewBooking, PaymentTransition};
pub use movie::Movie;
pub use show::Show;
