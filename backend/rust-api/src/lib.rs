use axum::{
    http::{header, Method},
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod assignment;
pub mod config;
pub mod error;
pub mod extractors;
pub mod grading;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api/v1/student", student_routes())
        .nest("/api/v1/instructor", instructor_routes())
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn student_routes() -> Router<AppState> {
    Router::new()
        .route("/join", post(handlers::student::join_exam))
        .route("/serial/{exam_id}", post(handlers::student::claim_seat))
        .route("/assignment/{exam_id}", get(handlers::student::get_assignment))
        .route("/question/{exam_id}", get(handlers::student::get_questions))
        .route("/submit/{exam_id}", post(handlers::student::submit_code))
        .route("/auto-save/{exam_id}", post(handlers::student::auto_save_code))
        .route("/timer/{exam_id}", get(handlers::student::get_timer))
        .route(
            "/code/{exam_id}/{question_id}",
            get(handlers::student::get_saved_code),
        )
        .route("/session/{exam_id}", get(handlers::student::get_session))
        .route(
            "/submissions/{exam_id}",
            get(handlers::student::get_submissions),
        )
        .route("/finish/{exam_id}", post(handlers::student::finish_exam))
}

fn instructor_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/exams/{exam_id}/close",
            post(handlers::instructor::close_exam),
        )
        .route(
            "/exams/{exam_id}/feasibility",
            get(handlers::instructor::assignment_feasibility),
        )
        .route(
            "/exams/{exam_id}/sessions",
            delete(handlers::instructor::delete_sessions),
        )
        .route(
            "/exams/{exam_id}/reset/{student_id}",
            post(handlers::instructor::reset_student),
        )
        .route("/exams", put(handlers::instructor::upsert_exam))
        .route("/students", put(handlers::instructor::upsert_student))
}
