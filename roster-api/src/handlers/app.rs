use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use super::{departments, groups, instructors, notifications, students, subjects, AppState};

pub fn add_routes(
    router: Router,
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    // Sockets stay open for the client's lifetime, so they are not counted against the limit.
    let events = Router::new()
        .route("/ws", routing::get(notifications::ws))
        .with_state(state.clone());

    let roster = Router::new()
        .route(
            "/departments",
            routing::get(departments::list).post(departments::create),
        )
        .route(
            "/departments/:id",
            routing::get(departments::get).delete(departments::delete),
        )
        .route(
            "/subjects",
            routing::get(subjects::list).post(subjects::create),
        )
        .route("/subjects/:id", routing::delete(subjects::delete))
        .route(
            "/instructors",
            routing::get(instructors::list).post(instructors::create),
        )
        .route(
            "/instructors/:id",
            routing::get(instructors::get)
                .put(instructors::update)
                .delete(instructors::delete),
        )
        .route(
            "/instructors/:id/photo",
            routing::get(instructors::get_photo)
                .post(instructors::upload_photo)
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route(
            "/students",
            routing::get(students::list).post(students::create),
        )
        .route(
            "/students/:id",
            routing::get(students::get)
                .put(students::update)
                .delete(students::delete),
        )
        .route("/students/:id/marks", routing::put(students::update_marks))
        .route(
            "/students/:id/photo",
            routing::get(students::get_photo)
                .post(students::upload_photo)
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/groups", routing::get(groups::list))
        .route("/groups/:id", routing::get(groups::get))
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(concurrency_limit));

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop in the api, just check axum health
        .merge(roster)
        .merge(events)
        .layer(TraceLayer::new_for_http())
}

pub async fn index() -> &'static str {
    "roster api"
}
