//! Фоновый обработчик отложенных задач.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::{future, stream, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::BookingError;
use crate::services::notifications::{Notification, NotificationSink};
use crate::services::reaper::ExpiryReaper;
use crate::services::scheduler::{ScheduledTask, Task, TaskScheduler};
use crate::store::BookingStore;

/// Сколько задач из одной пачки выполняются одновременно.
const CONCURRENCY: usize = 8;

#[derive(Clone)]
pub struct TaskWorker {
    scheduler: Arc<dyn TaskScheduler>,
    reaper: ExpiryReaper,
    store: Arc<dyn BookingStore>,
    notifications: NotificationSink,
    lease: Duration,
    batch: usize,
}

impl TaskWorker {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        reaper: ExpiryReaper,
        store: Arc<dyn BookingStore>,
        notifications: NotificationSink,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            scheduler,
            reaper,
            store,
            notifications,
            lease: Duration::seconds(config.lease_seconds),
            batch: config.batch_size,
        }
    }

    /// Бесконечный цикл опроса очереди.
    pub async fn run(self, poll_interval: StdDuration) {
        info!("Task worker started, polling every {:?}", poll_interval);
        loop {
            let processed = self.run_due(Utc::now()).await;
            // Если пачка заполнена целиком, сразу берём следующую
            if processed < self.batch {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    /// Обрабатывает созревшие к `now` задачи, возвращает число успешно выполненных.
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let tasks = match self.scheduler.lease_due(now, self.lease, self.batch).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to lease due tasks: {}", e);
                return 0;
            }
        };

        stream::iter(tasks)
            .map(|task| self.process(task, now))
            .buffer_unordered(CONCURRENCY)
            .filter(|ok| future::ready(*ok))
            .count()
            .await
    }

    async fn process(&self, task: ScheduledTask, now: DateTime<Utc>) -> bool {
        match self.dispatch(&task, now).await {
            Ok(()) => {
                // Не удалённая задача будет выполнена повторно после аренды
                if let Err(e) = self.scheduler.complete(&task).await {
                    warn!("Failed to complete task {}: {}", task.id, e);
                }
                true
            }
            Err(e) => {
                warn!("Task {} ({:?}) failed, will retry after lease: {}", task.id, task.task, e);
                false
            }
        }
    }

    async fn dispatch(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<(), BookingError> {
        match task.task {
            Task::ReleaseUnpaidBooking { booking_id } => {
                let outcome = self.reaper.release_if_unpaid(booking_id, now).await?;
                info!("Release task for booking {}: {:?}", booking_id, outcome);
                Ok(())
            }
            Task::ShowReminder { booking_id } => self.remind(booking_id).await,
        }
    }

    async fn remind(&self, booking_id: Uuid) -> Result<(), BookingError> {
        let Some(booking) = self.store.booking(booking_id).await? else {
            return Ok(());
        };
        // Отменённым и неоплаченным напоминание не шлём
        if !booking.is_paid || booking.is_cancelled {
            return Ok(());
        }
        let Some(show) = self.store.show(booking.show_id).await? else {
            return Ok(());
        };

        self.notifications.emit(Notification::ShowReminder {
            booking_id,
            user_id: booking.user_id,
            movie_title: show.movie_title,
            show_time: show.show_date_time,
            seats: booking.booked_seats,
        });
        Ok(())
    }
}
