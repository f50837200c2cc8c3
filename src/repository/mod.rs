use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        CollisionQuery, ComplianceSubmission, Guest, LifecycleEvent, NewAttempt, NewGuest,
        NewLifecycleEvent, NewProperty, NewReservation, NewSubUnit, NewSubmission,
        OperationalStatus, Property, Reservation, ReservationFilter, SubUnit, SubmissionAttempt,
        SubmissionFilter,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistence seam shared by the HTTP layer, the services and the job worker.
///
/// Implementations must enforce the same storage-level guarantees: unique
/// `external_id`, unique tourism license, and no two active reservations
/// overlapping within one `(property, sub-unit)` scope. Violations surface as
/// `AppError::Conflict`.
#[async_trait]
pub trait Store: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn health_check(&self) -> AppResult<()>;

    async fn insert_property(&self, property: NewProperty) -> AppResult<Property>;
    async fn get_property(&self, id: i64) -> AppResult<Option<Property>>;
    async fn get_property_by_public_id(&self, public_id: Uuid) -> AppResult<Option<Property>>;
    async fn list_properties(&self, limit: i64, offset: i64) -> AppResult<Vec<Property>>;

    async fn insert_sub_unit(&self, sub_unit: NewSubUnit) -> AppResult<SubUnit>;
    async fn get_sub_unit(&self, id: i64) -> AppResult<Option<SubUnit>>;
    async fn get_sub_unit_by_public_id(&self, public_id: Uuid) -> AppResult<Option<SubUnit>>;
    async fn list_sub_units(&self, property_id: i64) -> AppResult<Vec<SubUnit>>;

    async fn find_reservation_by_external_id(
        &self,
        external_id: &str,
    ) -> AppResult<Option<Reservation>>;
    async fn get_reservation(&self, id: i64) -> AppResult<Option<Reservation>>;
    async fn get_reservation_by_public_id(&self, public_id: Uuid)
        -> AppResult<Option<Reservation>>;
    async fn count_overlapping_reservations(&self, query: &CollisionQuery) -> AppResult<i64>;
    /// Active reservations with `check_in <= to` and `check_out >= from`,
    /// ordered by check-in.
    async fn list_active_reservations_between(
        &self,
        property_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<Reservation>>;
    /// Inserts the reservation, its guests and the creation event atomically.
    async fn insert_reservation(
        &self,
        reservation: NewReservation,
        guests: Vec<NewGuest>,
        event: NewLifecycleEvent,
    ) -> AppResult<Reservation>;
    async fn update_reservation(&self, reservation: &Reservation) -> AppResult<Reservation>;
    /// Touches only `operational_status`, leaving concurrent edits intact.
    async fn set_operational_status(
        &self,
        reservation_id: i64,
        status: OperationalStatus,
    ) -> AppResult<()>;
    async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> AppResult<(Vec<Reservation>, i64)>;
    async fn list_guests(&self, reservation_id: i64) -> AppResult<Vec<Guest>>;

    async fn insert_submission(&self, submission: NewSubmission)
        -> AppResult<ComplianceSubmission>;
    async fn get_submission(&self, id: i64) -> AppResult<Option<ComplianceSubmission>>;
    async fn find_submission_for_reservation(
        &self,
        reservation_id: i64,
    ) -> AppResult<Option<ComplianceSubmission>>;
    async fn update_submission(&self, submission: &ComplianceSubmission) -> AppResult<()>;
    /// Newest first.
    async fn list_submissions(
        &self,
        filter: &SubmissionFilter,
    ) -> AppResult<Vec<ComplianceSubmission>>;

    async fn insert_attempt(&self, attempt: NewAttempt) -> AppResult<SubmissionAttempt>;
    async fn latest_attempt(&self, submission_id: i64) -> AppResult<Option<SubmissionAttempt>>;
    async fn update_attempt(&self, attempt: &SubmissionAttempt) -> AppResult<()>;
    /// Oldest first.
    async fn list_attempts(&self, submission_id: i64) -> AppResult<Vec<SubmissionAttempt>>;

    async fn append_event(
        &self,
        reservation_id: i64,
        event: NewLifecycleEvent,
    ) -> AppResult<LifecycleEvent>;
    async fn list_events(&self, reservation_id: i64) -> AppResult<Vec<LifecycleEvent>>;
}
