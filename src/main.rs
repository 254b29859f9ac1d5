use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use showtime_booking::{
    cache,
    config::Config,
    controllers,
    database::Database,
    middleware::IdentityVerifier,
    redis_client::RedisClient,
    services::{
        notifications::NotificationSink,
        payment::{PaymentProvider, StripeClient},
        reaper::ExpiryReaper,
        scheduler::{RedisScheduler, TaskScheduler},
        worker::TaskWorker,
    },
    store::{BookingStore, PgStore},
    AppState, BookingContext,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(&config.app.rust_log);
    let registry = tracing_subscriber::registry().with(filter);
    if config.app.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;
    init_tracing(&config);

    info!("Starting showtime booking API ({})", config.app.environment);

    // Connect to the database
    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!("Database connected");

    db.run_migrations().await.context("Failed to run migrations")?;

    // Connect to Redis
    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    info!("Redis connected");

    let cache = cache::CacheService::new(redis.clone(), db.clone());
    cache.warmup_cache().await;

    // --- Booking core ---
    let store: Arc<dyn BookingStore> = Arc::new(PgStore::new(db.clone()));
    let payments: Arc<dyn PaymentProvider> = Arc::new(
        StripeClient::from_config(&config.payment, &config.circuit_breaker)
            .context("Failed to build payment client")?,
    );
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(RedisScheduler::new(redis.clone()));
    let notifications =
        NotificationSink::from_config(&config.notifications).context("Failed to build notification sink")?;

    let booking = BookingContext::new(
        store.clone(),
        payments.clone(),
        scheduler.clone(),
        notifications.clone(),
        IdentityVerifier::from_config(&config.jwt),
        &config.booking,
        config.app.frontend_url.clone(),
    );

    // --- Start background tasks ---

    // Reaper и напоминания: отложенные задачи из Redis
    let reaper = ExpiryReaper::new(store.clone(), payments, booking.reconciler.clone());
    let worker = TaskWorker::new(scheduler, reaper, store, notifications, &config.worker);
    task::spawn(worker.run(Duration::from_secs(config.worker.poll_seconds)));

    let app_state = Arc::new(AppState { db, redis, cache, booking });

    // --- Start the web server ---
    let app = Router::new()
        .route("/", get(|| async { "Showtime booking API v1.0" }))
        .route("/health", get(health))
        .nest("/api", controllers::routes(app_state.clone()))
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("HOST/PORT do not form a valid address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if !state.db.ping().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "DB unavailable");
    }
    // Без Redis не работают ни удержания мест, ни напоминания
    if !state.redis.ping().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "Redis unavailable");
    }
    (StatusCode::OK, "OK")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
