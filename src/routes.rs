// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{admin, assessments, attempts, auth, grading},
    state::AppState,
    utils::jwt::{admin_middleware, auth_middleware, student_middleware, teacher_middleware},
};

/// Assembles the main application router.
///
/// * Public: login.
/// * Admin: account creation.
/// * Teacher (and admin): authoring, assignment, grading, class averages.
/// * Student: the attempt flow and personal averages.
///
/// Role checks run after `auth_middleware` has validated the bearer token.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let auth_routes = Router::new().route("/login", post(auth::login));

    let admin_routes = Router::new()
        .route("/users", post(admin::create_user))
        // Auth first, then the role check
        .route_layer(middleware::from_fn(admin_middleware))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let teacher_routes = Router::new()
        .route(
            "/assessments",
            get(assessments::list_assessments).post(assessments::create_assessment),
        )
        .route(
            "/assessments/{id}",
            get(assessments::get_assessment)
                .put(assessments::update_assessment)
                .delete(assessments::delete_assessment),
        )
        .route("/assessments/{id}/assign", post(assessments::assign_assessment))
        .route("/assessments/{id}/submissions", get(grading::list_submissions))
        .route("/assessments/{id}/stats", get(grading::assessment_stats))
        .route(
            "/grading/{assignment_id}",
            get(grading::get_grading_sheet).post(grading::grade_attempt),
        )
        .route("/classes/{class_id}/averages", get(grading::class_averages))
        .route_layer(middleware::from_fn(teacher_middleware))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let student_routes = Router::new()
        .route("/attempts", get(attempts::list_my_attempts))
        .route("/attempts/{id}/start", post(attempts::start_attempt))
        .route("/attempts/{id}/timer", get(attempts::get_timer))
        .route("/attempts/{id}/save-answers", post(attempts::save_answers))
        .route("/attempts/{id}/violations", post(attempts::report_violation))
        .route("/attempts/{id}/submit", post(attempts::submit_attempt))
        .route("/attempts/{id}/result", get(attempts::get_result))
        .route("/students/me/averages", get(grading::my_averages))
        .route_layer(middleware::from_fn(student_middleware))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api/auth", auth_routes)
        .nest("/api/admin", admin_routes)
        .nest("/api", teacher_routes.merge(student_routes))
        // Global Middleware (applied from outside in)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
