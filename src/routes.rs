use crate::handlers;
use crate::state::AppState;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-client-token"),
            axum::http::HeaderName::from_static("x-request-id"),
        ]);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/companies", post(handlers::register_company))
        .route("/api/v1/evaluations", post(handlers::create_evaluation))
        .route("/api/v1/exams/:eurl", get(handlers::exam_info))
        .route("/api/v1/launches", post(handlers::create_launch))
        .route("/api/v1/quizzes/:quiz_id", get(handlers::quiz_detail))
        .route("/api/v1/quizzes/:quiz_id/answers", post(handlers::record_answer))
        .route("/api/v1/quizzes/:quiz_id/submit", post(handlers::submit_quiz))
        .route("/api/v1/quizzes/:quiz_id/result", get(handlers::quiz_result))
        .route("/api/v1/quizzes/:quiz_id/redirect", get(handlers::launch_redirect))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
