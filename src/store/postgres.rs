//! `Store` implementation over a Postgres pool.
//!
//! Queries are runtime-checked (`sqlx::query_as`) so builds never need a
//! live database. Anything that enforces an invariant across reads and
//! writes runs in a transaction; enrollment creation locks the course row
//! so concurrent requests serialize on the capacity check.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::Db,
    error::{is_unique_violation, AppError, Result},
    models::{
        cancellation_step, completion_step, percent_complete, Course, CourseDeletion,
        CourseFilter, CourseModule, CoursePatch, CourseStatus, Enrollment, EnrollmentDetail,
        EnrollmentFilter, EnrollmentStatus, IntentEventUpdate, ModuleProgress,
        ModuleProgressDetail, NewCourse, NewModule, NewUser, Payment, PaymentIntentRecord,
        ProgressUpdate, User, UserFilter, UserPatch,
    },
    pagination::Page,
    store::Store,
};

pub struct PgStore {
    pool: Db,
}

impl PgStore {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_user(&self, new: NewUser) -> Result<User> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, password_hash, first_name, last_name, phone, role)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.phone)
        .bind(new.role)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::conflict("Email is already registered")
            } else {
                e.into()
            }
        })
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_users(&self, filter: UserFilter, page: Page) -> Result<(Vec<User>, i64)> {
        let rows = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE ($1::user_role IS NULL OR role = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(filter.role)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE ($1::user_role IS NULL OR role = $1)")
                .bind(filter.role)
                .fetch_one(&self.pool)
                .await?;

        Ok((rows, total))
    }

    async fn update_user(&self, id: Uuid, patch: UserPatch) -> Result<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                first_name = COALESCE($2, first_name),
                last_name  = COALESCE($3, last_name),
                phone      = COALESCE($4, phone),
                role       = COALESCE($5, role),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.first_name)
        .bind(patch.last_name)
        .bind(patch.phone)
        .bind(patch.role)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("user"))
    }

    async fn create_course(&self, new: NewCourse) -> Result<Course> {
        Ok(sqlx::query_as::<_, Course>(
            r#"
            INSERT INTO courses
                (id, title, description, price, duration_hours, max_students, instructor_id, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.price)
        .bind(new.duration_hours)
        .bind(new.max_students)
        .bind(new.instructor_id)
        .bind(new.status)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn course_by_id(&self, id: Uuid) -> Result<Option<Course>> {
        Ok(
            sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_courses(&self, filter: CourseFilter, page: Page) -> Result<(Vec<Course>, i64)> {
        let rows = sqlx::query_as::<_, Course>(
            r#"
            SELECT * FROM courses
            WHERE ($1::course_status IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR instructor_id = $2)
              AND ($3::text IS NULL
                   OR title ILIKE '%' || $3 || '%'
                   OR description ILIKE '%' || $3 || '%')
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.status)
        .bind(filter.instructor_id)
        .bind(&filter.search)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM courses
            WHERE ($1::course_status IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR instructor_id = $2)
              AND ($3::text IS NULL
                   OR title ILIKE '%' || $3 || '%'
                   OR description ILIKE '%' || $3 || '%')
            "#,
        )
        .bind(filter.status)
        .bind(filter.instructor_id)
        .bind(&filter.search)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn update_course(&self, id: Uuid, patch: CoursePatch) -> Result<Course> {
        sqlx::query_as::<_, Course>(
            r#"
            UPDATE courses SET
                title          = COALESCE($2, title),
                description    = COALESCE($3, description),
                price          = COALESCE($4, price),
                duration_hours = COALESCE($5, duration_hours),
                max_students   = COALESCE($6, max_students),
                instructor_id  = COALESCE($7, instructor_id),
                status         = COALESCE($8, status),
                updated_at     = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.title)
        .bind(patch.description)
        .bind(patch.price)
        .bind(patch.duration_hours)
        .bind(patch.max_students)
        .bind(patch.instructor_id)
        .bind(patch.status)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("course"))
    }

    async fn delete_course(&self, id: Uuid) -> Result<CourseDeletion> {
        let mut tx = self.pool.begin().await?;

        let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound("course"))?;

        let enrollments: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM enrollments WHERE course_id = $1")
                .bind(course.id)
                .fetch_one(&mut *tx)
                .await?;

        let outcome = if enrollments > 0 {
            let archived = sqlx::query_as::<_, Course>(
                "UPDATE courses SET status = 'archived', updated_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(course.id)
            .fetch_one(&mut *tx)
            .await?;
            CourseDeletion::Archived(archived)
        } else {
            sqlx::query("DELETE FROM courses WHERE id = $1")
                .bind(course.id)
                .execute(&mut *tx)
                .await?;
            CourseDeletion::Removed
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn list_modules(&self, course_id: Uuid) -> Result<Vec<CourseModule>> {
        Ok(sqlx::query_as::<_, CourseModule>(
            "SELECT * FROM course_modules WHERE course_id = $1 ORDER BY order_index, created_at",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_module(&self, course_id: Uuid, new: NewModule) -> Result<CourseModule> {
        Ok(sqlx::query_as::<_, CourseModule>(
            r#"
            INSERT INTO course_modules
                (id, course_id, title, description, order_index, duration_minutes)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(course_id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.order_index)
        .bind(new.duration_minutes)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn create_enrollment(&self, user_id: Uuid, course_id: Uuid) -> Result<Enrollment> {
        let mut tx = self.pool.begin().await?;

        // Lock the course row so concurrent enrollments serialize on the
        // capacity check.
        let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1 FOR UPDATE")
            .bind(course_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound("course"))?;

        if course.status != CourseStatus::Published {
            return Err(AppError::bad_request("Course is not open for enrollment"));
        }

        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM enrollments WHERE user_id = $1 AND course_id = $2 AND status <> 'dropped'",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(AppError::conflict("You are already enrolled in this course"));
        }

        let seats: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM enrollments WHERE course_id = $1 AND status IN ('enrolled', 'completed')",
        )
        .bind(course_id)
        .fetch_one(&mut *tx)
        .await?;
        if seats >= i64::from(course.max_students) {
            return Err(AppError::bad_request("Course is full"));
        }

        // The partial unique index on active (user, course) pairs backstops
        // the duplicate check.
        let enrollment = sqlx::query_as::<_, Enrollment>(
            "INSERT INTO enrollments (id, user_id, course_id) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::conflict("You are already enrolled in this course")
            } else {
                e.into()
            }
        })?;

        tx.commit().await?;
        Ok(enrollment)
    }

    async fn enrollment_detail(&self, id: Uuid) -> Result<Option<EnrollmentDetail>> {
        Ok(sqlx::query_as::<_, EnrollmentDetail>(
            r#"
            SELECT e.*, c.title AS course_title, c.price AS course_price, c.instructor_id
            FROM enrollments e
            JOIN courses c ON c.id = e.course_id
            WHERE e.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_enrollments(
        &self,
        filter: EnrollmentFilter,
        page: Page,
    ) -> Result<(Vec<Enrollment>, i64)> {
        let rows = sqlx::query_as::<_, Enrollment>(
            r#"
            SELECT e.* FROM enrollments e
            JOIN courses c ON c.id = e.course_id
            WHERE ($1::uuid IS NULL OR e.user_id = $1)
              AND ($2::uuid IS NULL OR e.course_id = $2)
              AND ($3::enrollment_status IS NULL OR e.status = $3)
              AND ($4::uuid IS NULL OR c.instructor_id = $4)
            ORDER BY e.enrollment_date DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.course_id)
        .bind(filter.status)
        .bind(filter.instructor_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM enrollments e
            JOIN courses c ON c.id = e.course_id
            WHERE ($1::uuid IS NULL OR e.user_id = $1)
              AND ($2::uuid IS NULL OR e.course_id = $2)
              AND ($3::enrollment_status IS NULL OR e.status = $3)
              AND ($4::uuid IS NULL OR c.instructor_id = $4)
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.course_id)
        .bind(filter.status)
        .bind(filter.instructor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn complete_enrollment(&self, id: Uuid) -> Result<Enrollment> {
        let mut tx = self.pool.begin().await?;

        let current =
            sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(AppError::NotFound("enrollment"))?;

        let enrollment = match completion_step(current.status)? {
            None => current,
            Some(_) => {
                sqlx::query_as::<_, Enrollment>(
                    r#"
                    UPDATE enrollments SET
                        status = 'completed',
                        completion_date = COALESCE(completion_date, now()),
                        updated_at = now()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(id)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(enrollment)
    }

    async fn cancel_enrollment(&self, id: Uuid) -> Result<Enrollment> {
        let mut tx = self.pool.begin().await?;

        let current =
            sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(AppError::NotFound("enrollment"))?;

        let enrollment = match cancellation_step(current.status)? {
            None => current,
            Some(_) => {
                sqlx::query_as::<_, Enrollment>(
                    "UPDATE enrollments SET status = 'dropped', updated_at = now() WHERE id = $1 RETURNING *",
                )
                .bind(id)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(enrollment)
    }

    async fn record_progress(
        &self,
        enrollment_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<(Enrollment, ModuleProgress)> {
        let mut tx = self.pool.begin().await?;

        let enrollment =
            sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1 FOR UPDATE")
                .bind(enrollment_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(AppError::NotFound("enrollment"))?;

        if enrollment.status == EnrollmentStatus::Dropped {
            return Err(AppError::conflict(
                "Cannot record progress on a dropped enrollment",
            ));
        }

        let module: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM course_modules WHERE id = $1 AND course_id = $2")
                .bind(update.module_id)
                .bind(enrollment.course_id)
                .fetch_optional(&mut *tx)
                .await?;
        if module.is_none() {
            return Err(AppError::NotFound("module"));
        }

        // completed is sticky, completed_at stamps once, time accumulates
        let progress = sqlx::query_as::<_, ModuleProgress>(
            r#"
            INSERT INTO module_progress
                (id, enrollment_id, module_id, completed, completed_at, time_spent_minutes)
            VALUES ($1, $2, $3, $4, CASE WHEN $4 THEN now() END, $5)
            ON CONFLICT (enrollment_id, module_id) DO UPDATE SET
                completed = module_progress.completed OR EXCLUDED.completed,
                completed_at = COALESCE(module_progress.completed_at,
                                        CASE WHEN EXCLUDED.completed THEN now() END),
                time_spent_minutes = module_progress.time_spent_minutes + EXCLUDED.time_spent_minutes,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(enrollment_id)
        .bind(update.module_id)
        .bind(update.completed)
        .bind(update.time_spent_minutes)
        .fetch_one(&mut *tx)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM course_modules WHERE course_id = $1")
            .bind(enrollment.course_id)
            .fetch_one(&mut *tx)
            .await?;
        let done: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM module_progress mp
            JOIN course_modules m ON m.id = mp.module_id
            WHERE mp.enrollment_id = $1 AND mp.completed
            "#,
        )
        .bind(enrollment_id)
        .fetch_one(&mut *tx)
        .await?;

        let pct = percent_complete(done, total);
        let enrollment = sqlx::query_as::<_, Enrollment>(
            r#"
            UPDATE enrollments SET
                progress_percentage = $2,
                completion_date = CASE WHEN $3 AND status = 'enrolled'
                                       THEN COALESCE(completion_date, now())
                                       ELSE completion_date END,
                status = CASE WHEN $3 AND status = 'enrolled'
                              THEN 'completed'::enrollment_status
                              ELSE status END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(pct)
        .bind(pct >= 100.0)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((enrollment, progress))
    }

    async fn progress_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<ModuleProgressDetail>> {
        Ok(sqlx::query_as::<_, ModuleProgressDetail>(
            r#"
            SELECT mp.module_id, m.title, m.order_index, mp.completed,
                   mp.completed_at, mp.time_spent_minutes, mp.updated_at
            FROM module_progress mp
            JOIN course_modules m ON m.id = mp.module_id
            WHERE mp.enrollment_id = $1
            ORDER BY m.order_index, m.created_at
            "#,
        )
        .bind(enrollment_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_payment_intent(&self, record: PaymentIntentRecord) -> Result<Payment> {
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments
                (id, user_id, enrollment_id, stripe_payment_intent_id, amount_cents, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, enrollment_id) DO UPDATE SET
                stripe_payment_intent_id = EXCLUDED.stripe_payment_intent_id,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.user_id)
        .bind(record.enrollment_id)
        .bind(&record.intent_id)
        .bind(record.amount_cents)
        .bind(&record.currency)
        .bind(record.status)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE enrollments SET payment_status = 'pending', updated_at = now()
             WHERE id = $1 AND payment_status <> 'paid'",
        )
        .bind(record.enrollment_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(payment)
    }

    async fn apply_intent_event(&self, update: IntentEventUpdate) -> Result<Option<Payment>> {
        let mut tx = self.pool.begin().await?;

        // Events referencing an enrollment we do not know are dropped, not
        // failed: the sender retries failures.
        let known: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM enrollments WHERE id = $1 AND user_id = $2")
                .bind(update.enrollment_id)
                .bind(update.user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if known.is_none() {
            return Ok(None);
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments
                (id, user_id, enrollment_id, stripe_payment_intent_id,
                 amount_cents, currency, status, amount_refunded_cents)
            VALUES ($1, $2, $3, $4, COALESCE($5, 0), COALESCE($6, 'usd'), $7, $8)
            ON CONFLICT (user_id, enrollment_id) DO UPDATE SET
                stripe_payment_intent_id = $4,
                amount_cents = COALESCE($5, payments.amount_cents),
                currency = COALESCE($6, payments.currency),
                status = $7,
                amount_refunded_cents = COALESCE($8, payments.amount_refunded_cents),
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(update.user_id)
        .bind(update.enrollment_id)
        .bind(&update.intent_id)
        .bind(update.amount_cents)
        .bind(&update.currency)
        .bind(update.status)
        .bind(update.amount_refunded_cents)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE enrollments SET payment_status = $2, updated_at = now() WHERE id = $1")
            .bind(update.enrollment_id)
            .bind(update.payment_state)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(payment))
    }

    async fn apply_refund_by_intent(
        &self,
        intent_id: &str,
        amount_refunded_cents: Option<i64>,
    ) -> Result<Option<Payment>> {
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET
                status = 'refunded',
                amount_refunded_cents = COALESCE($2, amount_refunded_cents, amount_cents),
                updated_at = now()
            WHERE stripe_payment_intent_id = $1
            RETURNING *
            "#,
        )
        .bind(intent_id)
        .bind(amount_refunded_cents)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payment) = payment else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE enrollments SET payment_status = 'refunded', updated_at = now() WHERE id = $1",
        )
        .bind(payment.enrollment_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(payment))
    }

    async fn payment_for_enrollment(
        &self,
        user_id: Uuid,
        enrollment_id: Uuid,
    ) -> Result<Option<Payment>> {
        Ok(sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE user_id = $1 AND enrollment_id = $2",
        )
        .bind(user_id)
        .bind(enrollment_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}
