use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Actor,
    error::{AppError, Result},
    models::{
        CreateEnrollmentReq, EnrollmentDetail, EnrollmentFilter, EnrollmentListQuery,
        ProgressUpdate, RecordProgressReq, UserRole,
    },
    pagination::PageParams,
    routes::{ok, paged},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(show).delete(cancel))
        .route("/:id/complete", put(complete))
        .route("/:id/progress", get(progress).put(record_progress))
}

fn can_view(detail: &EnrollmentDetail, actor: &Actor) -> bool {
    actor.is_admin()
        || detail.enrollment.user_id == actor.id
        || detail.instructor_id == Some(actor.id)
}

async fn detail_for(state: &AppState, id: Uuid) -> Result<EnrollmentDetail> {
    state
        .store
        .enrollment_detail(id)
        .await?
        .ok_or(AppError::NotFound("enrollment"))
}

async fn create(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<CreateEnrollmentReq>,
) -> Result<(StatusCode, Json<Value>)> {
    if actor.role != UserRole::Student {
        return Err(AppError::forbidden("Only students can enroll in courses"));
    }
    let enrollment = state.store.create_enrollment(actor.id, req.course_id).await?;
    tracing::info!(enrollment = %enrollment.id, course = %req.course_id, "student enrolled");
    Ok((StatusCode::CREATED, ok(enrollment)))
}

/// Students see their own enrollments, instructors their courses',
/// admins everything.
async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<EnrollmentListQuery>,
) -> Result<Json<Value>> {
    let filter = match actor.role {
        UserRole::Admin => EnrollmentFilter {
            user_id: query.user_id,
            course_id: query.course_id,
            status: query.status,
            instructor_id: None,
        },
        UserRole::Instructor => EnrollmentFilter {
            user_id: query.user_id,
            course_id: query.course_id,
            status: query.status,
            instructor_id: Some(actor.id),
        },
        UserRole::Student => EnrollmentFilter {
            user_id: Some(actor.id),
            course_id: query.course_id,
            status: query.status,
            instructor_id: None,
        },
    };

    let page = PageParams {
        page: query.page,
        limit: query.limit,
    }
    .resolve();
    let (enrollments, total) = state.store.list_enrollments(filter, page).await?;
    Ok(paged(enrollments, page, total))
}

async fn show(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let detail = detail_for(&state, id).await?;
    if !can_view(&detail, &actor) {
        return Err(AppError::forbidden(
            "You do not have access to this enrollment",
        ));
    }
    Ok(ok(detail))
}

async fn complete(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let detail = detail_for(&state, id).await?;
    if !can_view(&detail, &actor) {
        return Err(AppError::forbidden(
            "You do not have access to this enrollment",
        ));
    }
    let enrollment = state.store.complete_enrollment(id).await?;
    Ok(ok(enrollment))
}

/// Cancellation belongs to the student (or an admin); instructors cannot
/// drop their students.
async fn cancel(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let detail = detail_for(&state, id).await?;
    if detail.enrollment.user_id != actor.id && !actor.is_admin() {
        return Err(AppError::forbidden(
            "You do not have access to this enrollment",
        ));
    }
    let enrollment = state.store.cancel_enrollment(id).await?;
    Ok(ok(enrollment))
}

async fn record_progress(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<RecordProgressReq>,
) -> Result<Json<Value>> {
    let detail = detail_for(&state, id).await?;
    if detail.enrollment.user_id != actor.id && !actor.is_admin() {
        return Err(AppError::forbidden(
            "You do not have access to this enrollment",
        ));
    }
    req.validate().map_err(AppError::from_validation)?;

    let (enrollment, module_progress) = state
        .store
        .record_progress(
            id,
            ProgressUpdate {
                module_id: req.module_id,
                completed: req.completed.unwrap_or(false),
                time_spent_minutes: req.time_spent_minutes.unwrap_or(0),
            },
        )
        .await?;
    Ok(ok(json!({
        "enrollment": enrollment,
        "progress": module_progress,
    })))
}

async fn progress(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let detail = detail_for(&state, id).await?;
    if !can_view(&detail, &actor) {
        return Err(AppError::forbidden(
            "You do not have access to this enrollment",
        ));
    }

    let modules = state.store.progress_for_enrollment(id).await?;
    let total_time: i64 = modules.iter().map(|m| i64::from(m.time_spent_minutes)).sum();
    Ok(ok(json!({
        "enrollment": detail,
        "modules": modules,
        "total_time_spent_minutes": total_time,
    })))
}
