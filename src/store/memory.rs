//! In-memory `Store` for the HTTP test suite and for running without a
//! database. One mutex over all tables keeps every multi-step operation
//! atomic; no method awaits while holding the lock.

use std::{
    cmp::Reverse,
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::{
        cancellation_step, completion_step, percent_complete, Course, CourseDeletion,
        CourseFilter, CourseModule, CoursePatch, CourseStatus, Enrollment, EnrollmentDetail,
        EnrollmentFilter, EnrollmentStatus, IntentEventUpdate, ModuleProgress,
        ModuleProgressDetail, NewCourse, NewModule, NewUser, Payment, PaymentIntentRecord,
        PaymentState, PaymentStatus, ProgressUpdate, User, UserFilter, UserPatch,
    },
    pagination::Page,
    store::Store,
};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    courses: HashMap<Uuid, Course>,
    modules: HashMap<Uuid, CourseModule>,
    enrollments: HashMap<Uuid, Enrollment>,
    /// Keyed by (enrollment, module).
    progress: HashMap<(Uuid, Uuid), ModuleProgress>,
    /// Keyed by (user, enrollment), mirroring the unique pair in Postgres.
    payments: HashMap<(Uuid, Uuid), Payment>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| AppError::internal("store mutex poisoned"))
    }
}

fn paginate<T>(rows: Vec<T>, page: Page) -> (Vec<T>, i64) {
    let total = rows.len() as i64;
    let rows = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect();
    (rows, total)
}

#[async_trait]
impl Store for MemStore {
    async fn create_user(&self, new: NewUser) -> Result<User> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        if inner.users.values().any(|u| u.email == new.email) {
            return Err(AppError::conflict("Email is already registered"));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            password_hash: new.password_hash,
            first_name: new.first_name,
            last_name: new.last_name,
            phone: new.phone,
            role: new.role,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let guard = self.lock()?;
        Ok(guard.users.values().find(|u| u.email == email).cloned())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let guard = self.lock()?;
        Ok(guard.users.get(&id).cloned())
    }

    async fn list_users(&self, filter: UserFilter, page: Page) -> Result<(Vec<User>, i64)> {
        let guard = self.lock()?;
        let mut rows: Vec<User> = guard
            .users
            .values()
            .filter(|u| filter.role.map_or(true, |r| u.role == r))
            .cloned()
            .collect();
        rows.sort_by_key(|u| Reverse(u.created_at));
        Ok(paginate(rows, page))
    }

    async fn update_user(&self, id: Uuid, patch: UserPatch) -> Result<User> {
        let mut guard = self.lock()?;
        let user = guard.users.get_mut(&id).ok_or(AppError::NotFound("user"))?;

        if let Some(v) = patch.first_name {
            user.first_name = v;
        }
        if let Some(v) = patch.last_name {
            user.last_name = v;
        }
        if let Some(v) = patch.phone {
            user.phone = Some(v);
        }
        if let Some(v) = patch.role {
            user.role = v;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn create_course(&self, new: NewCourse) -> Result<Course> {
        let mut guard = self.lock()?;
        let now = Utc::now();
        let course = Course {
            id: Uuid::new_v4(),
            title: new.title,
            description: new.description,
            price: new.price,
            duration_hours: new.duration_hours,
            max_students: new.max_students,
            instructor_id: new.instructor_id,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        guard.courses.insert(course.id, course.clone());
        Ok(course)
    }

    async fn course_by_id(&self, id: Uuid) -> Result<Option<Course>> {
        let guard = self.lock()?;
        Ok(guard.courses.get(&id).cloned())
    }

    async fn list_courses(&self, filter: CourseFilter, page: Page) -> Result<(Vec<Course>, i64)> {
        let guard = self.lock()?;
        let needle = filter.search.as_deref().map(str::to_lowercase);
        let mut rows: Vec<Course> = guard
            .courses
            .values()
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .filter(|c| filter.instructor_id.map_or(true, |i| c.instructor_id == Some(i)))
            .filter(|c| {
                needle.as_deref().map_or(true, |q| {
                    c.title.to_lowercase().contains(q)
                        || c.description
                            .as_deref()
                            .map_or(false, |d| d.to_lowercase().contains(q))
                })
            })
            .cloned()
            .collect();
        rows.sort_by_key(|c| Reverse(c.created_at));
        Ok(paginate(rows, page))
    }

    async fn update_course(&self, id: Uuid, patch: CoursePatch) -> Result<Course> {
        let mut guard = self.lock()?;
        let course = guard
            .courses
            .get_mut(&id)
            .ok_or(AppError::NotFound("course"))?;

        if let Some(v) = patch.title {
            course.title = v;
        }
        if let Some(v) = patch.description {
            course.description = Some(v);
        }
        if let Some(v) = patch.price {
            course.price = v;
        }
        if let Some(v) = patch.duration_hours {
            course.duration_hours = v;
        }
        if let Some(v) = patch.max_students {
            course.max_students = v;
        }
        if let Some(v) = patch.instructor_id {
            course.instructor_id = Some(v);
        }
        if let Some(v) = patch.status {
            course.status = v;
        }
        course.updated_at = Utc::now();
        Ok(course.clone())
    }

    async fn delete_course(&self, id: Uuid) -> Result<CourseDeletion> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let course = inner
            .courses
            .get_mut(&id)
            .ok_or(AppError::NotFound("course"))?;

        let enrolled = inner.enrollments.values().any(|e| e.course_id == id);
        if enrolled {
            course.status = CourseStatus::Archived;
            course.updated_at = Utc::now();
            Ok(CourseDeletion::Archived(course.clone()))
        } else {
            inner.courses.remove(&id);
            inner.modules.retain(|_, m| m.course_id != id);
            Ok(CourseDeletion::Removed)
        }
    }

    async fn list_modules(&self, course_id: Uuid) -> Result<Vec<CourseModule>> {
        let guard = self.lock()?;
        let mut rows: Vec<CourseModule> = guard
            .modules
            .values()
            .filter(|m| m.course_id == course_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| (m.order_index, m.created_at));
        Ok(rows)
    }

    async fn create_module(&self, course_id: Uuid, new: NewModule) -> Result<CourseModule> {
        let mut guard = self.lock()?;
        let module = CourseModule {
            id: Uuid::new_v4(),
            course_id,
            title: new.title,
            description: new.description,
            order_index: new.order_index,
            duration_minutes: new.duration_minutes,
            created_at: Utc::now(),
        };
        guard.modules.insert(module.id, module.clone());
        Ok(module)
    }

    async fn create_enrollment(&self, user_id: Uuid, course_id: Uuid) -> Result<Enrollment> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let course = inner
            .courses
            .get(&course_id)
            .ok_or(AppError::NotFound("course"))?;
        if course.status != CourseStatus::Published {
            return Err(AppError::bad_request("Course is not open for enrollment"));
        }

        let duplicate = inner.enrollments.values().any(|e| {
            e.user_id == user_id && e.course_id == course_id && e.status != EnrollmentStatus::Dropped
        });
        if duplicate {
            return Err(AppError::conflict("You are already enrolled in this course"));
        }

        let seats = inner
            .enrollments
            .values()
            .filter(|e| e.course_id == course_id && e.status.holds_seat())
            .count();
        if seats as i64 >= i64::from(course.max_students) {
            return Err(AppError::bad_request("Course is full"));
        }

        let now = Utc::now();
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            status: EnrollmentStatus::Enrolled,
            enrollment_date: now,
            completion_date: None,
            payment_status: PaymentState::Pending,
            progress_percentage: 0.0,
            created_at: now,
            updated_at: now,
        };
        inner.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    async fn enrollment_detail(&self, id: Uuid) -> Result<Option<EnrollmentDetail>> {
        let guard = self.lock()?;
        let Some(enrollment) = guard.enrollments.get(&id) else {
            return Ok(None);
        };
        let Some(course) = guard.courses.get(&enrollment.course_id) else {
            return Ok(None);
        };
        Ok(Some(EnrollmentDetail {
            enrollment: enrollment.clone(),
            course_title: course.title.clone(),
            course_price: course.price,
            instructor_id: course.instructor_id,
        }))
    }

    async fn list_enrollments(
        &self,
        filter: EnrollmentFilter,
        page: Page,
    ) -> Result<(Vec<Enrollment>, i64)> {
        let guard = self.lock()?;
        let mut rows: Vec<Enrollment> = guard
            .enrollments
            .values()
            .filter(|e| filter.user_id.map_or(true, |u| e.user_id == u))
            .filter(|e| filter.course_id.map_or(true, |c| e.course_id == c))
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| {
                filter.instructor_id.map_or(true, |i| {
                    guard
                        .courses
                        .get(&e.course_id)
                        .map_or(false, |c| c.instructor_id == Some(i))
                })
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| Reverse(e.enrollment_date));
        Ok(paginate(rows, page))
    }

    async fn complete_enrollment(&self, id: Uuid) -> Result<Enrollment> {
        let mut guard = self.lock()?;
        let enrollment = guard
            .enrollments
            .get_mut(&id)
            .ok_or(AppError::NotFound("enrollment"))?;

        if let Some(next) = completion_step(enrollment.status)? {
            let now = Utc::now();
            enrollment.status = next;
            enrollment.completion_date = enrollment.completion_date.or(Some(now));
            enrollment.updated_at = now;
        }
        Ok(enrollment.clone())
    }

    async fn cancel_enrollment(&self, id: Uuid) -> Result<Enrollment> {
        let mut guard = self.lock()?;
        let enrollment = guard
            .enrollments
            .get_mut(&id)
            .ok_or(AppError::NotFound("enrollment"))?;

        if let Some(next) = cancellation_step(enrollment.status)? {
            enrollment.status = next;
            enrollment.updated_at = Utc::now();
        }
        Ok(enrollment.clone())
    }

    async fn record_progress(
        &self,
        enrollment_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<(Enrollment, ModuleProgress)> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let course_id = {
            let enrollment = inner
                .enrollments
                .get(&enrollment_id)
                .ok_or(AppError::NotFound("enrollment"))?;
            if enrollment.status == EnrollmentStatus::Dropped {
                return Err(AppError::conflict(
                    "Cannot record progress on a dropped enrollment",
                ));
            }
            enrollment.course_id
        };

        let belongs = inner
            .modules
            .get(&update.module_id)
            .map_or(false, |m| m.course_id == course_id);
        if !belongs {
            return Err(AppError::NotFound("module"));
        }

        let now = Utc::now();
        let progress = {
            let entry = inner
                .progress
                .entry((enrollment_id, update.module_id))
                .or_insert_with(|| ModuleProgress {
                    id: Uuid::new_v4(),
                    enrollment_id,
                    module_id: update.module_id,
                    completed: false,
                    completed_at: None,
                    time_spent_minutes: 0,
                    created_at: now,
                    updated_at: now,
                });
            if update.completed {
                entry.completed = true;
                entry.completed_at = entry.completed_at.or(Some(now));
            }
            entry.time_spent_minutes += update.time_spent_minutes;
            entry.updated_at = now;
            entry.clone()
        };

        let total = inner
            .modules
            .values()
            .filter(|m| m.course_id == course_id)
            .count() as i64;
        let done = inner
            .progress
            .values()
            .filter(|p| {
                p.enrollment_id == enrollment_id
                    && p.completed
                    && inner.modules.contains_key(&p.module_id)
            })
            .count() as i64;
        let pct = percent_complete(done, total);

        let enrollment = inner
            .enrollments
            .get_mut(&enrollment_id)
            .ok_or(AppError::NotFound("enrollment"))?;
        enrollment.progress_percentage = pct;
        if pct >= 100.0 && enrollment.status == EnrollmentStatus::Enrolled {
            enrollment.status = EnrollmentStatus::Completed;
            enrollment.completion_date = enrollment.completion_date.or(Some(now));
        }
        enrollment.updated_at = now;

        Ok((enrollment.clone(), progress))
    }

    async fn progress_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<ModuleProgressDetail>> {
        let guard = self.lock()?;
        let mut rows: Vec<(i32, chrono::DateTime<Utc>, ModuleProgressDetail)> = guard
            .progress
            .values()
            .filter(|p| p.enrollment_id == enrollment_id)
            .filter_map(|p| {
                let module = guard.modules.get(&p.module_id)?;
                Some((
                    module.order_index,
                    module.created_at,
                    ModuleProgressDetail {
                        module_id: p.module_id,
                        title: module.title.clone(),
                        order_index: module.order_index,
                        completed: p.completed,
                        completed_at: p.completed_at,
                        time_spent_minutes: p.time_spent_minutes,
                        updated_at: p.updated_at,
                    },
                ))
            })
            .collect();
        rows.sort_by_key(|(order, created, _)| (*order, *created));
        Ok(rows.into_iter().map(|(_, _, detail)| detail).collect())
    }

    async fn upsert_payment_intent(&self, record: PaymentIntentRecord) -> Result<Payment> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let now = Utc::now();

        let key = (record.user_id, record.enrollment_id);
        let payment = match inner.payments.get_mut(&key) {
            Some(p) => {
                p.stripe_payment_intent_id = record.intent_id;
                p.amount_cents = record.amount_cents;
                p.currency = record.currency;
                p.status = record.status;
                p.updated_at = now;
                p.clone()
            }
            None => {
                let payment = Payment {
                    id: Uuid::new_v4(),
                    user_id: record.user_id,
                    enrollment_id: record.enrollment_id,
                    stripe_payment_intent_id: record.intent_id,
                    amount_cents: record.amount_cents,
                    currency: record.currency,
                    status: record.status,
                    amount_refunded_cents: None,
                    created_at: now,
                    updated_at: now,
                };
                inner.payments.insert(key, payment.clone());
                payment
            }
        };

        if let Some(enrollment) = inner.enrollments.get_mut(&record.enrollment_id) {
            if enrollment.payment_status != PaymentState::Paid {
                enrollment.payment_status = PaymentState::Pending;
                enrollment.updated_at = now;
            }
        }

        Ok(payment)
    }

    async fn apply_intent_event(&self, update: IntentEventUpdate) -> Result<Option<Payment>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let known = inner
            .enrollments
            .get(&update.enrollment_id)
            .map_or(false, |e| e.user_id == update.user_id);
        if !known {
            return Ok(None);
        }

        let now = Utc::now();
        let key = (update.user_id, update.enrollment_id);
        let payment = match inner.payments.get_mut(&key) {
            Some(p) => {
                p.stripe_payment_intent_id = update.intent_id;
                if let Some(amount) = update.amount_cents {
                    p.amount_cents = amount;
                }
                if let Some(currency) = update.currency {
                    p.currency = currency;
                }
                if let Some(refunded) = update.amount_refunded_cents {
                    p.amount_refunded_cents = Some(refunded);
                }
                p.status = update.status;
                p.updated_at = now;
                p.clone()
            }
            None => {
                let payment = Payment {
                    id: Uuid::new_v4(),
                    user_id: update.user_id,
                    enrollment_id: update.enrollment_id,
                    stripe_payment_intent_id: update.intent_id,
                    amount_cents: update.amount_cents.unwrap_or(0),
                    currency: update.currency.unwrap_or_else(|| "usd".to_string()),
                    status: update.status,
                    amount_refunded_cents: update.amount_refunded_cents,
                    created_at: now,
                    updated_at: now,
                };
                inner.payments.insert(key, payment.clone());
                payment
            }
        };

        if let Some(enrollment) = inner.enrollments.get_mut(&update.enrollment_id) {
            enrollment.payment_status = update.payment_state;
            enrollment.updated_at = now;
        }

        Ok(Some(payment))
    }

    async fn apply_refund_by_intent(
        &self,
        intent_id: &str,
        amount_refunded_cents: Option<i64>,
    ) -> Result<Option<Payment>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let now = Utc::now();

        let Some(payment) = inner
            .payments
            .values_mut()
            .find(|p| p.stripe_payment_intent_id == intent_id)
        else {
            return Ok(None);
        };
        payment.status = PaymentStatus::Refunded;
        payment.amount_refunded_cents = amount_refunded_cents
            .or(payment.amount_refunded_cents)
            .or(Some(payment.amount_cents));
        payment.updated_at = now;
        let payment = payment.clone();

        if let Some(enrollment) = inner.enrollments.get_mut(&payment.enrollment_id) {
            enrollment.payment_status = PaymentState::Refunded;
            enrollment.updated_at = now;
        }

        Ok(Some(payment))
    }

    async fn payment_for_enrollment(
        &self,
        user_id: Uuid,
        enrollment_id: Uuid,
    ) -> Result<Option<Payment>> {
        let guard = self.lock()?;
        Ok(guard.payments.get(&(user_id, enrollment_id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::models::UserRole;
    use crate::pagination::PageParams;

    fn page() -> Page {
        PageParams::default().resolve()
    }

    async fn seed_course(store: &MemStore, max_students: i32) -> Course {
        store
            .create_course(NewCourse {
                title: "Part 107 Ground School".into(),
                description: None,
                price: Decimal::new(19900, 2),
                duration_hours: 12,
                max_students,
                instructor_id: None,
                status: CourseStatus::Published,
            })
            .await
            .unwrap()
    }

    async fn seed_student(store: &MemStore, email: &str) -> User {
        store
            .create_user(NewUser {
                email: email.into(),
                password_hash: "hash".into(),
                first_name: "Test".into(),
                last_name: "Pilot".into(),
                phone: None,
                role: UserRole::Student,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = MemStore::new();
        seed_student(&store, "pilot@example.com").await;
        let err = store
            .create_user(NewUser {
                email: "pilot@example.com".into(),
                password_hash: "hash".into(),
                first_name: "Other".into(),
                last_name: "Pilot".into(),
                phone: None,
                role: UserRole::Student,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn enrollment_capacity_counts_completed_seats() {
        let store = MemStore::new();
        let course = seed_course(&store, 1).await;
        let first = seed_student(&store, "a@example.com").await;
        let second = seed_student(&store, "b@example.com").await;

        let enrollment = store.create_enrollment(first.id, course.id).await.unwrap();
        store.complete_enrollment(enrollment.id).await.unwrap();

        let err = store
            .create_enrollment(second.id, course.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn dropped_enrollment_frees_the_seat() {
        let store = MemStore::new();
        let course = seed_course(&store, 1).await;
        let first = seed_student(&store, "a@example.com").await;
        let second = seed_student(&store, "b@example.com").await;

        let enrollment = store.create_enrollment(first.id, course.id).await.unwrap();
        store.cancel_enrollment(enrollment.id).await.unwrap();

        store.create_enrollment(second.id, course.id).await.unwrap();
        // The dropped row no longer reads as a duplicate; only the taken
        // seat blocks the first student now.
        let err = store.create_enrollment(first.id, course.id).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn completion_date_is_stamped_once() {
        let store = MemStore::new();
        let course = seed_course(&store, 10).await;
        let student = seed_student(&store, "a@example.com").await;
        let enrollment = store.create_enrollment(student.id, course.id).await.unwrap();

        let first = store.complete_enrollment(enrollment.id).await.unwrap();
        let second = store.complete_enrollment(enrollment.id).await.unwrap();
        assert_eq!(first.completion_date, second.completion_date);
        assert_eq!(second.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn progress_accumulates_time_and_keeps_completed_sticky() {
        let store = MemStore::new();
        let course = seed_course(&store, 10).await;
        let module = store
            .create_module(
                course.id,
                NewModule {
                    title: "Airspace".into(),
                    description: None,
                    order_index: 1,
                    duration_minutes: None,
                },
            )
            .await
            .unwrap();
        let student = seed_student(&store, "a@example.com").await;
        let enrollment = store.create_enrollment(student.id, course.id).await.unwrap();

        let (_, first) = store
            .record_progress(
                enrollment.id,
                ProgressUpdate {
                    module_id: module.id,
                    completed: true,
                    time_spent_minutes: 10,
                },
            )
            .await
            .unwrap();
        let (enrollment, second) = store
            .record_progress(
                enrollment.id,
                ProgressUpdate {
                    module_id: module.id,
                    completed: false,
                    time_spent_minutes: 15,
                },
            )
            .await
            .unwrap();

        assert!(second.completed);
        assert_eq!(second.completed_at, first.completed_at);
        assert_eq!(second.time_spent_minutes, 25);
        assert_eq!(enrollment.progress_percentage, 100.0);
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_enrollment_event_is_dropped() {
        let store = MemStore::new();
        let applied = store
            .apply_intent_event(IntentEventUpdate {
                user_id: Uuid::new_v4(),
                enrollment_id: Uuid::new_v4(),
                intent_id: "pi_unknown".into(),
                amount_cents: Some(1000),
                currency: None,
                amount_refunded_cents: None,
                status: PaymentStatus::Succeeded,
                payment_state: PaymentState::Paid,
            })
            .await
            .unwrap();
        assert!(applied.is_none());
    }
}
