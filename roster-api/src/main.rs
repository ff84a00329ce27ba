use std::str::FromStr;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use roster_common::metrics::{serve, setup_metrics_routes};

mod config;
mod handlers;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let options = PgConnectOptions::from_str(&config.database_url)?.application_name("roster-api");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy_with(options);

    sqlx::migrate!("../migrations").run(&pool).await?;

    let events = handlers::BalanceEvents::new(config.balance_events_capacity);
    let listener = handlers::listen_balance_done(&pool).await?;
    tokio::spawn(handlers::relay_balance_done(listener, events.clone()));

    let state = handlers::AppState {
        pool,
        balance_max_attempts: config.balance_max_attempts,
        events,
    };
    let app = handlers::add_routes(
        Router::new(),
        state,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app, "roster-api")?;

    tracing::info!("roster-api listening on {}", config.bind());
    if let Err(e) = serve(app, &config.bind()).await {
        tracing::error!("failed to start roster-api http server, {}", e);
        return Err(e.into());
    }

    Ok(())
}
