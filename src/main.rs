use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slotbook::app::AppState;
use slotbook::config::Config;
use slotbook::db;
use slotbook::jobs;
use slotbook::store::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slotbook=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting slotbook...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    // Build application state
    let policy = config.booking_policy()?;
    let state = AppState::postgres(PgStore::new(pool), config.gateway.as_ref(), policy)?;
    tracing::info!(
        fee_per_match = %state.bookings.policy().platform_fee_per_match,
        "Booking core ready"
    );

    // Background jobs
    let mut scheduler = jobs::start_scheduler(
        state.ledger.clone(),
        state.dispatcher.clone(),
        &config.sweep_schedule,
        config.hold_timeout(),
    )
    .await?;

    shutdown_signal().await?;

    scheduler.shutdown().await?;
    if state.dispatcher.pending_count() > 0 {
        tracing::warn!(
            pending = state.dispatcher.pending_count(),
            "Exiting with undelivered side effects"
        );
    }

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, cleaning up...");
    Ok(())
}
