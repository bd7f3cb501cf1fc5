//! Persistence gateway.
//!
//! Every query the service runs goes through the [`Store`] trait. The
//! production implementation is [`PgStore`]; [`MemStore`] backs the
//! integration tests and keeps the whole API testable without a database.
//!
//! Multi-step invariants (seat capacity, enrollment uniqueness, status
//! transitions, payment upserts) are enforced inside the store so they stay
//! atomic with the writes they guard.

mod memory;
mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        Course, CourseDeletion, CourseFilter, CourseModule, CoursePatch, Enrollment,
        EnrollmentDetail, EnrollmentFilter, IntentEventUpdate, ModuleProgress,
        ModuleProgressDetail, NewCourse, NewModule, NewUser, Payment, PaymentIntentRecord,
        ProgressUpdate, User, UserFilter, UserPatch,
    },
    pagination::Page,
};

#[async_trait]
pub trait Store: Send + Sync {
    // users
    async fn create_user(&self, new: NewUser) -> Result<User>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn list_users(&self, filter: UserFilter, page: Page) -> Result<(Vec<User>, i64)>;
    async fn update_user(&self, id: Uuid, patch: UserPatch) -> Result<User>;

    // courses
    async fn create_course(&self, new: NewCourse) -> Result<Course>;
    async fn course_by_id(&self, id: Uuid) -> Result<Option<Course>>;
    async fn list_courses(&self, filter: CourseFilter, page: Page) -> Result<(Vec<Course>, i64)>;
    async fn update_course(&self, id: Uuid, patch: CoursePatch) -> Result<Course>;
    async fn delete_course(&self, id: Uuid) -> Result<CourseDeletion>;
    async fn list_modules(&self, course_id: Uuid) -> Result<Vec<CourseModule>>;
    async fn create_module(&self, course_id: Uuid, new: NewModule) -> Result<CourseModule>;

    // enrollments
    /// Atomic create: checks the course is published, the caller has no
    /// other active enrollment, and a seat is free.
    async fn create_enrollment(&self, user_id: Uuid, course_id: Uuid) -> Result<Enrollment>;
    async fn enrollment_detail(&self, id: Uuid) -> Result<Option<EnrollmentDetail>>;
    async fn list_enrollments(
        &self,
        filter: EnrollmentFilter,
        page: Page,
    ) -> Result<(Vec<Enrollment>, i64)>;
    /// Idempotent on already-completed rows; conflicts on dropped ones.
    async fn complete_enrollment(&self, id: Uuid) -> Result<Enrollment>;
    /// Idempotent on already-dropped rows; conflicts on completed ones.
    async fn cancel_enrollment(&self, id: Uuid) -> Result<Enrollment>;

    // progress
    async fn record_progress(
        &self,
        enrollment_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<(Enrollment, ModuleProgress)>;
    async fn progress_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<ModuleProgressDetail>>;

    // payments
    /// Record a locally created intent, replacing any previous intent for
    /// the same (user, enrollment) pair.
    async fn upsert_payment_intent(&self, record: PaymentIntentRecord) -> Result<Payment>;
    /// Apply one webhook event. Returns `None` when the referenced
    /// enrollment does not exist for that user; callers drop such events.
    async fn apply_intent_event(&self, update: IntentEventUpdate) -> Result<Option<Payment>>;
    /// Refund fallback for events that carry no metadata, keyed on the
    /// processor's intent id. Returns `None` when no payment matches.
    async fn apply_refund_by_intent(
        &self,
        intent_id: &str,
        amount_refunded_cents: Option<i64>,
    ) -> Result<Option<Payment>>;
    async fn payment_for_enrollment(
        &self,
        user_id: Uuid,
        enrollment_id: Uuid,
    ) -> Result<Option<Payment>>;
}
