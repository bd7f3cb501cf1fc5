use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{Actor, MaybeActor},
    error::{AppError, Result},
    models::{
        Course, CourseDeletion, CourseFilter, CourseListQuery, CoursePatch, CourseStatus,
        CreateCourseReq, CreateModuleReq, NewCourse, NewModule, UpdateCourseReq,
    },
    pagination::PageParams,
    routes::{ok, paged},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(show).put(update).delete(remove))
        .route("/:id/modules", get(list_modules).post(create_module))
}

/// Drafts and archived courses only exist for staff; everyone else sees
/// the published catalog.
fn visible_to(course: &Course, actor: Option<&Actor>) -> bool {
    course.status == CourseStatus::Published || actor.map_or(false, Actor::is_staff)
}

async fn list(
    State(state): State<AppState>,
    MaybeActor(actor): MaybeActor,
    Query(query): Query<CourseListQuery>,
) -> Result<Json<Value>> {
    let staff = actor.as_ref().map_or(false, Actor::is_staff);
    let status = if staff {
        query.status
    } else {
        Some(CourseStatus::Published)
    };

    let page = PageParams {
        page: query.page,
        limit: query.limit,
    }
    .resolve();
    let (courses, total) = state
        .store
        .list_courses(
            CourseFilter {
                status,
                instructor_id: query.instructor_id,
                search: query.search,
            },
            page,
        )
        .await?;
    Ok(paged(courses, page, total))
}

async fn create(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<CreateCourseReq>,
) -> Result<(StatusCode, Json<Value>)> {
    if !actor.is_staff() {
        return Err(AppError::forbidden(
            "Only instructors and admins can create courses",
        ));
    }
    req.validate().map_err(AppError::from_validation)?;

    // Instructors always own what they create; admins may assign anyone.
    let instructor_id = if actor.is_admin() {
        req.instructor_id
    } else {
        match req.instructor_id {
            Some(other) if other != actor.id => {
                return Err(AppError::forbidden(
                    "Instructors can only create their own courses",
                ))
            }
            _ => Some(actor.id),
        }
    };

    let course = state
        .store
        .create_course(NewCourse {
            title: req.title,
            description: req.description,
            price: req.price,
            duration_hours: req.duration_hours,
            max_students: req.max_students,
            instructor_id,
            status: req.status.unwrap_or(CourseStatus::Draft),
        })
        .await?;
    Ok((StatusCode::CREATED, ok(course)))
}

async fn show(
    State(state): State<AppState>,
    MaybeActor(actor): MaybeActor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let course = state
        .store
        .course_by_id(id)
        .await?
        .ok_or(AppError::NotFound("course"))?;
    if !visible_to(&course, actor.as_ref()) {
        return Err(AppError::NotFound("course"));
    }
    Ok(ok(course))
}

async fn update(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCourseReq>,
) -> Result<Json<Value>> {
    let course = state
        .store
        .course_by_id(id)
        .await?
        .ok_or(AppError::NotFound("course"))?;
    if !actor.manages(&course) {
        return Err(AppError::forbidden("You do not manage this course"));
    }
    req.validate().map_err(AppError::from_validation)?;
    if let Some(new_instructor) = req.instructor_id {
        if course.instructor_id != Some(new_instructor) && !actor.is_admin() {
            return Err(AppError::forbidden("Only admins can reassign instructors"));
        }
    }

    let course = state
        .store
        .update_course(
            id,
            CoursePatch {
                title: req.title,
                description: req.description,
                price: req.price,
                duration_hours: req.duration_hours,
                max_students: req.max_students,
                instructor_id: req.instructor_id,
                status: req.status,
            },
        )
        .await?;
    Ok(ok(course))
}

/// Courses with enrollment history are archived instead of removed so
/// existing enrollments keep resolving.
async fn remove(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    if !actor.is_admin() {
        return Err(AppError::forbidden("Only admins can delete courses"));
    }

    match state.store.delete_course(id).await? {
        CourseDeletion::Removed => Ok(ok(json!({ "removed": true }))),
        CourseDeletion::Archived(course) => {
            tracing::info!(course = %course.id, "archived course with existing enrollments");
            Ok(ok(json!({ "removed": false, "course": course })))
        }
    }
}

async fn list_modules(
    State(state): State<AppState>,
    MaybeActor(actor): MaybeActor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    let course = state
        .store
        .course_by_id(id)
        .await?
        .ok_or(AppError::NotFound("course"))?;
    if !visible_to(&course, actor.as_ref()) {
        return Err(AppError::NotFound("course"));
    }
    let modules = state.store.list_modules(id).await?;
    Ok(ok(modules))
}

async fn create_module(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateModuleReq>,
) -> Result<(StatusCode, Json<Value>)> {
    let course = state
        .store
        .course_by_id(id)
        .await?
        .ok_or(AppError::NotFound("course"))?;
    if !actor.manages(&course) {
        return Err(AppError::forbidden("You do not manage this course"));
    }
    req.validate().map_err(AppError::from_validation)?;

    let module = state
        .store
        .create_module(
            id,
            NewModule {
                title: req.title,
                description: req.description,
                order_index: req.order_index,
                duration_minutes: req.duration_minutes,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, ok(module)))
}
