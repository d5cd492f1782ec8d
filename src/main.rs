// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use quiz_live::config::Config;
use quiz_live::live::{BroadcastHub, Orchestrator, PinAllocator};
use quiz_live::routes;
use quiz_live::state::AppState;
use quiz_live::store::{PgQuizCatalog, PgSessionStore, QuizOwnership};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load configuration from environment (.env included)
    let config = Config::from_env();

    let file_appender = tracing_appender::rolling::daily("logs", "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Initialize Database Pool with Retry
    let mut retry_count = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retry_count += 1;
                if retry_count > 5 {
                    panic!("Failed to connect to database after 5 retries: {}", e);
                }
                tracing::warn!("Database not ready, retrying in 2s... (Attempt {})", retry_count);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    };

    tracing::info!("Database connected...");

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Migrations applied successfully.");

    let orchestrator = Orchestrator::new(
        Arc::new(PgSessionStore::new(pool.clone())),
        Arc::new(PgQuizCatalog::new(pool)),
        Arc::new(QuizOwnership),
        PinAllocator::random(config.pin_max_attempts),
        BroadcastHub::spawn(config.broadcast_capacity),
    );

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        config: config.clone(),
    };

    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind {}: {}", config.bind_address, e));
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
