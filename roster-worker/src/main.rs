//! Consume `BalanceQueue` jobs to rebalance department groups.
use std::future::ready;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tracing::error;

use roster_common::balancer::Balancer;
use roster_common::health::HealthRegistry;
use roster_common::metrics::{serve, setup_metrics_routes};
use roster_common::pgqueue::BalanceQueue;
use roster_common::retry::RetryPolicy;
use roster_worker::config::Config;
use roster_worker::worker::BalanceWorker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker", time::Duration::seconds(60));

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let queue = BalanceQueue::new(
        &config.database_url,
        config.max_pg_connections,
        "roster-worker",
    )?;
    sqlx::migrate!("../migrations").run(queue.pool()).await?;

    let worker = BalanceWorker::new(
        config.worker_name.as_str(),
        &queue,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        Balancer::new(config.max_students_per_group),
        retry_policy,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router, "roster-worker")?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start serving metrics, {}", e);
        }
    });

    worker.run().await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "roster worker"
}
