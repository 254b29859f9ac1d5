use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub payment: PaymentConfig,
    pub booking: BookingConfig,
    pub notifications: NotificationConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub worker: WorkerConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    /// `json` включает структурированные логи
    pub log_format: String,
    /// Адрес фронтенда, если у запроса нет заголовка Origin
    pub frontend_url: String,
}

// Настройки базы данных
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

// Настройки Redis
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

// Настройки JWT
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub admin_email: Option<String>,
}

// Настройки платёжного провайдера
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub api_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub currency: String,
    pub timeout_seconds: u64,
}

// Правила бронирования
#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    /// Через сколько секунд неоплаченная бронь освобождается
    pub hold_seconds: i64,
    pub payment_session_ttl_seconds: i64,
    pub max_seats_per_booking: usize,
    /// За сколько секунд до сеанса слать напоминание
    pub reminder_lead_seconds: i64,
}

// Настройки уведомлений
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
}

// Настройки Circuit Breaker
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

// Настройки фонового обработчика задач
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub poll_seconds: u64,
    pub lease_seconds: i64,
    pub batch_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Собирает конфигурацию из произвольного источника переменных.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let hold_seconds: i64 = vars.parse_or("BOOKING_HOLD_SECONDS", 600)?;
        let payment_session_ttl_seconds: i64 = vars.parse_or("PAYMENT_SESSION_TTL_SECONDS", 1800)?;
        // Сессия должна жить дольше удержания, иначе клиент не успеет заплатить
        if payment_session_ttl_seconds <= hold_seconds {
            anyhow::bail!("PAYMENT_SESSION_TTL_SECONDS must be greater than BOOKING_HOLD_SECONDS");
        }

        Ok(Config {
            app: AppConfig {
                host: vars.string_or("HOST", "0.0.0.0"),
                port: vars.parse_or("PORT", 8000)?,
                environment: vars.string_or("ENVIRONMENT", "development"),
                rust_log: vars.string_or("RUST_LOG", "showtime_booking=debug,tower_http=debug"),
                log_format: vars.string_or("LOG_FORMAT", "pretty"),
                frontend_url: vars.string_or("FRONTEND_URL", "http://localhost:5173"),
            },
            database: DatabaseConfig {
                url: vars.required("DATABASE_URL")?,
                pool_size: vars.parse_or("DB_POOL_SIZE", 20)?,
            },
            redis: RedisConfig {
                url: vars.required("REDIS_URL")?,
            },
            jwt: JwtConfig {
                secret: vars.required("JWT_SECRET")?,
                admin_email: vars.optional("ADMIN_EMAIL"),
            },
            payment: PaymentConfig {
                api_url: vars.string_or("STRIPE_API_URL", "https://api.stripe.com"),
                secret_key: vars.required("STRIPE_SECRET_KEY")?,
                webhook_secret: vars.required("STRIPE_WEBHOOK_SECRET")?,
                currency: vars.string_or("CURRENCY", "inr").to_lowercase(),
                timeout_seconds: vars.parse_or("PAYMENT_TIMEOUT_SECONDS", 10)?,
            },
            booking: BookingConfig {
                hold_seconds,
                payment_session_ttl_seconds,
                max_seats_per_booking: vars.parse_or("MAX_SEATS_PER_BOOKING", 5)?,
                reminder_lead_seconds: vars.parse_or("REMINDER_LEAD_SECONDS", 8 * 3600)?,
            },
            notifications: NotificationConfig {
                webhook_url: vars.optional("NOTIFY_WEBHOOK_URL"),
                timeout_seconds: vars.parse_or("NOTIFY_TIMEOUT_SECONDS", 5)?,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: vars.parse_or("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5)?,
                timeout_seconds: vars.parse_or("CIRCUIT_BREAKER_TIMEOUT_SECONDS", 60)?,
            },
            worker: WorkerConfig {
                poll_seconds: vars.parse_or("WORKER_POLL_SECONDS", 1)?,
                lease_seconds: vars.parse_or("WORKER_LEASE_SECONDS", 60)?,
                batch_size: vars.parse_or("WORKER_BATCH_SIZE", 50)?,
            },
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    // Пустое значение считаем отсутствующим
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key).with_context(|| format!("{} must be set", key))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{} must be a valid value, got '{}'", key, raw)),
            None => Ok(default),
        }
    }
}
