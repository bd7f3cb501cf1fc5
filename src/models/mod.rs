pub mod course;
pub mod enrollment;
pub mod payment;
pub mod user;

pub use course::{
    Course, CourseDeletion, CourseFilter, CourseListQuery, CourseModule, CoursePatch,
    CourseStatus, CreateCourseReq, CreateModuleReq, NewCourse, NewModule, UpdateCourseReq,
};
pub use enrollment::{
    cancellation_step, completion_step, percent_complete, CreateEnrollmentReq, Enrollment,
    EnrollmentDetail, EnrollmentFilter, EnrollmentListQuery, EnrollmentStatus, ModuleProgress,
    ModuleProgressDetail, PaymentState, ProgressUpdate, RecordProgressReq,
};
pub use payment::{CreateIntentReq, IntentEventUpdate, Payment, PaymentIntentRecord, PaymentStatus};
pub use user::{
    LoginReq, NewUser, RegisterReq, UpdateUserReq, User, UserFilter, UserListQuery, UserPatch,
    UserRole,
};
