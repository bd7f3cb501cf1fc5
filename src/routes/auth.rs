use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use validator::Validate;

use crate::{
    auth::issue_token,
    error::{AppError, Result},
    models::{LoginReq, NewUser, RegisterReq, UserRole},
    routes::ok,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
}

/// Self-service signup. Always creates a student; staff accounts are
/// promoted by an admin afterwards.
async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<(StatusCode, Json<Value>)> {
    req.validate().map_err(AppError::from_validation)?;

    let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)?;
    let user = state
        .store
        .create_user(NewUser {
            email: req.email,
            password_hash,
            first_name: req.first_name,
            last_name: req.last_name,
            phone: req.phone,
            role: UserRole::Student,
        })
        .await?;

    let token = issue_token(
        &state.config.jwt_secret,
        state.config.token_ttl_hours,
        user.id,
        user.role,
    )?;
    tracing::info!(user = %user.id, "registered new student");

    Ok((StatusCode::CREATED, ok(json!({ "user": user, "token": token }))))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Json<Value>> {
    req.validate().map_err(AppError::from_validation)?;

    // Unknown email and wrong password answer identically.
    let user = state
        .store
        .user_by_email(&req.email)
        .await?
        .ok_or_else(|| AppError::unauthenticated("Invalid email or password"))?;
    if !bcrypt::verify(&req.password, &user.password_hash)? {
        return Err(AppError::unauthenticated("Invalid email or password"));
    }

    let token = issue_token(
        &state.config.jwt_secret,
        state.config.token_ttl_hours,
        user.id,
        user.role,
    )?;

    Ok(ok(json!({ "user": user, "token": token })))
}
