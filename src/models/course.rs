use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "course_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Draft,
    Published,
    Archived,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub duration_hours: i32,
    pub max_students: i32,
    pub instructor_id: Option<Uuid>,
    pub status: CourseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One teachable unit of a course; the denominator of progress tracking.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct CourseModule {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub order_index: i32,
    pub duration_minutes: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a delete request: rows with enrollment history are archived
/// instead of removed.
#[derive(Debug, Clone)]
pub enum CourseDeletion {
    Removed,
    Archived(Course),
}

/// Insert payload with the caller-dependent fields already resolved.
#[derive(Debug, Clone)]
pub struct NewCourse {
    pub title: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub duration_hours: i32,
    pub max_students: i32,
    pub instructor_id: Option<Uuid>,
    pub status: CourseStatus,
}

#[derive(Debug, Clone)]
pub struct NewModule {
    pub title: String,
    pub description: Option<String>,
    pub order_index: i32,
    pub duration_minutes: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct CourseFilter {
    pub status: Option<CourseStatus>,
    pub instructor_id: Option<Uuid>,
    pub search: Option<String>,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct CoursePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub duration_hours: Option<i32>,
    pub max_students: Option<i32>,
    pub instructor_id: Option<Uuid>,
    pub status: Option<CourseStatus>,
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct CreateCourseReq {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: Option<String>,
    #[validate(custom(function = validate_price))]
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub duration_hours: i32,
    #[validate(range(min = 1, message = "must allow at least one student"))]
    pub max_students: i32,
    pub instructor_id: Option<Uuid>,
    pub status: Option<CourseStatus>,
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct UpdateCourseReq {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    pub description: Option<String>,
    #[validate(custom(function = validate_price))]
    pub price: Option<Decimal>,
    #[validate(range(min = 0))]
    pub duration_hours: Option<i32>,
    #[validate(range(min = 1, message = "must allow at least one student"))]
    pub max_students: Option<i32>,
    pub instructor_id: Option<Uuid>,
    pub status: Option<CourseStatus>,
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct CreateModuleReq {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub order_index: i32,
    #[validate(range(min = 0))]
    pub duration_minutes: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CourseListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<CourseStatus>,
    pub instructor_id: Option<Uuid>,
    pub search: Option<String>,
}

fn validate_price(price: &Decimal) -> Result<(), ValidationError> {
    if price.is_sign_negative() {
        let mut err = ValidationError::new("negative");
        err.message = Some("must not be negative".into());
        return Err(err);
    }
    Ok(())
}
