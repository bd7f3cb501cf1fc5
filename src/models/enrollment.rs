use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, Result};

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    Completed,
    Dropped,
}

impl EnrollmentStatus {
    /// Whether this enrollment consumes one of the course's seats.
    pub fn holds_seat(self) -> bool {
        matches!(self, Self::Enrolled | Self::Completed)
    }
}

/// Reconciled payment state carried on the enrollment itself.
#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payment_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Enrollment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub status: EnrollmentStatus,
    pub enrollment_date: DateTime<Utc>,
    pub completion_date: Option<DateTime<Utc>>,
    pub payment_status: PaymentState,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Enrollment joined with the course fields access checks and payment
/// creation need.
#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
pub struct EnrollmentDetail {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub course_title: String,
    pub course_price: Decimal,
    pub instructor_id: Option<Uuid>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ModuleProgress {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub module_id: Uuid,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub time_spent_minutes: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Progress row joined with its module for the detail view.
#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
pub struct ModuleProgressDetail {
    pub module_id: Uuid,
    pub title: String,
    pub order_index: i32,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub time_spent_minutes: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnrollmentFilter {
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub status: Option<EnrollmentStatus>,
    /// Restrict to enrollments in courses taught by this instructor.
    pub instructor_id: Option<Uuid>,
}

/// Normalized progress write: `completed` is sticky, time is a non-negative
/// increment.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub module_id: Uuid,
    pub completed: bool,
    pub time_spent_minutes: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CreateEnrollmentReq {
    pub course_id: Uuid,
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct RecordProgressReq {
    pub module_id: Uuid,
    pub completed: Option<bool>,
    #[validate(range(min = 0, message = "must not be negative"))]
    pub time_spent_minutes: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EnrollmentListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<EnrollmentStatus>,
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
}

/// Next status for an explicit completion. `Ok(None)` means already
/// completed, which callers treat as a no-op.
pub fn completion_step(current: EnrollmentStatus) -> Result<Option<EnrollmentStatus>> {
    match current {
        EnrollmentStatus::Enrolled => Ok(Some(EnrollmentStatus::Completed)),
        EnrollmentStatus::Completed => Ok(None),
        EnrollmentStatus::Dropped => Err(AppError::conflict(
            "Cannot complete a dropped enrollment",
        )),
    }
}

/// Next status for a cancellation. `Ok(None)` means already dropped.
pub fn cancellation_step(current: EnrollmentStatus) -> Result<Option<EnrollmentStatus>> {
    match current {
        EnrollmentStatus::Enrolled => Ok(Some(EnrollmentStatus::Dropped)),
        EnrollmentStatus::Dropped => Ok(None),
        EnrollmentStatus::Completed => Err(AppError::conflict(
            "Cannot cancel a completed enrollment",
        )),
    }
}

/// Share of completed modules as a percentage, rounded to two decimals.
/// Courses without modules report zero.
pub fn percent_complete(completed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let pct = completed as f64 * 100.0 / total as f64;
    (pct * 100.0).round() / 100.0
}
