use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Request latencies: most roster calls are a single short transaction.
const REQUEST_SECONDS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Balancing runs lock a department and rewrite its assignments, so they get a longer tail.
const BALANCE_SECONDS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Routes polled by orchestration and scrapers, kept out of the request metrics.
const UNTRACKED_PATHS: &[&str] = &["/metrics", "/_liveness", "/_readiness"];

/// Bind a `TcpListener` on `bind` and serve `router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the Prometheus recorder for `service`, add a `/metrics` route to `router` and record
/// request metrics for its routes.
pub fn setup_metrics_routes(router: Router, service: &'static str) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder(service)?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

fn setup_metrics_recorder(service: &'static str) -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .add_global_label("service", service)
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_owned()),
            REQUEST_SECONDS,
        )?
        .set_buckets_for_metric(
            Matcher::Prefix("balance_".to_owned()),
            BALANCE_SECONDS,
        )?
        .install_recorder()
}

/// Record a counter and a latency histogram per method, matched route and status class.
/// Requests refused by an eligibility rule are also counted on their own.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    // Matched paths keep ids out of the labels.
    let route = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };

    if UNTRACKED_PATHS.contains(&route.as_str()) {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().to_string();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status();

    if status == StatusCode::CONFLICT {
        metrics::counter!("roster_requests_refused_total", "route" => route.clone()).increment(1);
    }

    let labels = [
        ("method", method),
        ("route", route),
        ("status", status_class(status).to_owned()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}
