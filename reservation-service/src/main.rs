use anyhow::Result;
use clap::Parser;
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reservation_service::api;
use reservation_service::clock::{Clock, SystemClock};
use reservation_service::config::Config;
use reservation_service::store::{
    run_migrations, MemoryReservationStore, PgReservationStore, ReservationStore,
};
use reservation_service::trigger::SweepTicker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let config = Config::parse();

    let store: Arc<dyn ReservationStore> = if config.in_memory {
        info!("Using in-memory reservation store");
        Arc::new(MemoryReservationStore::new())
    } else {
        info!("Running database migrations...");
        run_migrations(&config.database_url)?;
        info!("Migrations completed successfully");

        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
        let pool = Pool::builder().max_size(config.pool_size).build(manager).await?;
        Arc::new(PgReservationStore::new(pool))
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let app_state = api::AppState::new(store, clock, &config.settings());

    if let Some(period) = config.sweep_interval() {
        let ticker = SweepTicker::new(app_state.sweeper.clone(), period);
        tokio::spawn(async move {
            ticker.run().await;
        });
    }

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Reservation service started on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
