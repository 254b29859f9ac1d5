//! Уведомления пользователям: подтверждение и отмена брони, новый сеанс,
//! напоминание о сеансе.
//!
//! Отправка "выстрелил и забыл": `NotificationSink::emit` запускает доставку
//! в фоне, ошибки только логируются и никогда не доходят до вызывающего.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::NotificationConfig;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    BookingConfirmed {
        booking_id: Uuid,
        user_id: String,
        movie_title: String,
        show_time: DateTime<Utc>,
        seats: Vec<String>,
        amount: i64,
    },
    BookingCancelled {
        booking_id: Uuid,
        user_id: String,
        movie_title: String,
        show_time: DateTime<Utc>,
        seats: Vec<String>,
        refunded: bool,
        refund_amount: i64,
    },
    NewShowAdded {
        movie_title: String,
    },
    ShowReminder {
        booking_id: Uuid,
        user_id: String,
        movie_title: String,
        show_time: DateTime<Utc>,
        seats: Vec<String>,
    },
}

/// Готовое к отправке сообщение.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundMessage {
    /// `None` означает рассылку всем подписчикам.
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
    pub notification: Notification,
}

impl Notification {
    pub fn render(&self) -> OutboundMessage {
        let time = |t: &DateTime<Utc>| t.format("%d %b %Y, %H:%M UTC").to_string();

        let (recipient, subject, body) = match self {
            Notification::BookingConfirmed { user_id, movie_title, show_time, seats, amount, .. } => (
                Some(user_id.clone()),
                format!("Payment confirmation: '{}' booking", movie_title),
                format!(
                    "Your booking for '{}' on {} is confirmed. Seats: {}. Amount paid: {}.",
                    movie_title,
                    time(show_time),
                    seats.join(", "),
                    format_amount(*amount)
                ),
            ),
            Notification::BookingCancelled { user_id, movie_title, show_time, seats, refunded, refund_amount, .. } => {
                let refund_line = if *refunded {
                    format!("A refund of {} has been issued.", format_amount(*refund_amount))
                } else {
                    "No refund was issued for this booking.".to_string()
                };
                (
                    Some(user_id.clone()),
                    format!("Booking cancelled: '{}'", movie_title),
                    format!(
                        "Your booking for '{}' on {} (seats {}) has been cancelled. {}",
                        movie_title,
                        time(show_time),
                        seats.join(", "),
                        refund_line
                    ),
                )
            }
            Notification::NewShowAdded { movie_title } => (
                None,
                format!("New show added: {}", movie_title),
                format!("'{}' is now open for booking. Grab your seats!", movie_title),
            ),
            Notification::ShowReminder { user_id, movie_title, show_time, seats, .. } => (
                Some(user_id.clone()),
                format!("Reminder: '{}' starts soon", movie_title),
                format!(
                    "'{}' starts at {}. Your seats: {}. Enjoy the show!",
                    movie_title,
                    time(show_time),
                    seats.join(", ")
                ),
            ),
        };

        OutboundMessage { recipient, subject, body, notification: self.clone() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Notification::BookingConfirmed { .. } => "booking_confirmed",
            Notification::BookingCancelled { .. } => "booking_cancelled",
            Notification::NewShowAdded { .. } => "new_show_added",
            Notification::ShowReminder { .. } => "show_reminder",
        }
    }
}

// Суммы хранятся в минимальных единицах валюты
fn format_amount(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, (minor % 100).abs())
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay rejected message with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), NotifyError>;
}

/// Только пишет сообщение в лог. Используется, когда relay не настроен.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        info!(
            recipient = message.recipient.as_deref().unwrap_or("*"),
            "Notification '{}': {}",
            message.subject,
            message.body
        );
        Ok(())
    }
}

/// Передаёт сообщение во внешний relay (почтовый сервис и т.п.) по HTTP.
pub struct HttpNotifier {
    url: String,
    http_client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(url: String, timeout_seconds: u64) -> Result<Self, NotifyError> {
        Ok(Self {
            url,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_seconds))
                .build()?,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        let response = self.http_client.post(&self.url).json(message).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationSink {
    notifier: Arc<dyn Notifier>,
}

impl NotificationSink {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotifyError> {
        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => Arc::new(HttpNotifier::new(url.clone(), config.timeout_seconds)?),
            None => Arc::new(LogNotifier),
        };
        Ok(Self::new(notifier))
    }

    /// Отправляет уведомление в фоне, не блокируя вызывающего.
    pub fn emit(&self, notification: Notification) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let message = notification.render();
            if let Err(e) = notifier.deliver(&message).await {
                error!("Failed to deliver {} notification: {}", notification.name(), e);
            }
        });
    }
}
