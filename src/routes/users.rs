use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Actor,
    error::{AppError, Result},
    models::{UpdateUserReq, UserFilter, UserListQuery, UserPatch},
    pagination::PageParams,
    routes::{ok, paged},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/:id", get(show).put(update))
}

async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Value>> {
    if !actor.is_admin() {
        return Err(AppError::forbidden("Only admins can list users"));
    }

    let page = PageParams {
        page: query.page,
        limit: query.limit,
    }
    .resolve();
    let (users, total) = state
        .store
        .list_users(UserFilter { role: query.role }, page)
        .await?;
    Ok(paged(users, page, total))
}

async fn show(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>> {
    if actor.id != id && !actor.is_admin() {
        return Err(AppError::forbidden("You do not have access to this user"));
    }
    let user = state
        .store
        .user_by_id(id)
        .await?
        .ok_or(AppError::NotFound("user"))?;
    Ok(ok(user))
}

async fn update(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUserReq>,
) -> Result<Json<Value>> {
    if actor.id != id && !actor.is_admin() {
        return Err(AppError::forbidden("You do not have access to this user"));
    }
    req.validate().map_err(AppError::from_validation)?;
    if req.role.is_some() && !actor.is_admin() {
        return Err(AppError::forbidden("Only admins can change roles"));
    }

    let user = state
        .store
        .update_user(
            id,
            UserPatch {
                first_name: req.first_name,
                last_name: req.last_name,
                phone: req.phone,
                role: req.role,
            },
        )
        .await?;
    Ok(ok(user))
}
