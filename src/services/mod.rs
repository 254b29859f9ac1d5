pub mod cancellation;
pub mod notifications;
pub mod payment;
pub mod reaper;
pub mod reconciliation;
pub mod reservation;
pub mod scheduler;
pub mod signature;
pub mod worker;
