pub mod auth;
pub mod courses;
pub mod enrollments;
pub mod payments;
pub mod users;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    pagination::{Page, PageMeta},
    AppState,
};

/// Success envelope shared by every handler.
pub(crate) fn ok(data: impl Serialize) -> Json<Value> {
    Json(json!({ "status": "success", "data": data }))
}

/// Success envelope for listings, with page metadata alongside the rows.
pub(crate) fn paged(data: impl Serialize, page: Page, total: i64) -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": data,
        "pagination": PageMeta::new(page, total),
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/auth", auth::router())
        .nest("/api/users", users::router())
        .nest("/api/courses", courses::router())
        .nest("/api/enrollments", enrollments::router())
        .nest("/api/payments", payments::router())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({ "service": "groundschool-api", "status": "ok" }))
}

async fn health() -> &'static str {
    "ok"
}
