use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Store;
use crate::{
    error::{AppError, AppResult},
    models::{
        CollisionQuery, ComplianceSubmission, Guest, LifecycleEvent, NewAttempt, NewGuest,
        NewLifecycleEvent, NewProperty, NewReservation, NewSubUnit, NewSubmission,
        OperationalStatus, Property, Reservation, ReservationFilter, SubUnit, SubmissionAttempt,
        SubmissionFilter, SubmissionState,
    },
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    properties: Vec<Property>,
    sub_units: Vec<SubUnit>,
    reservations: Vec<Reservation>,
    guests: Vec<Guest>,
    submissions: Vec<ComplianceSubmission>,
    attempts: Vec<SubmissionAttempt>,
    events: Vec<LifecycleEvent>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Mirrors the unique index and exclusion constraint of the SQL schema.
    fn check_reservation_constraints(&self, candidate: &Reservation) -> AppResult<()> {
        if let Some(external_id) = candidate.external_id.as_deref() {
            let duplicate = self.reservations.iter().any(|existing| {
                existing.id != candidate.id && existing.external_id.as_deref() == Some(external_id)
            });
            if duplicate {
                return Err(AppError::Conflict(
                    "Duplicate value violates a unique constraint.".to_string(),
                ));
            }
        }

        if !candidate.status.is_active() {
            return Ok(());
        }
        let scope = CollisionQuery {
            property_id: candidate.property_id,
            sub_unit_id: candidate.sub_unit_id,
            check_in: candidate.check_in,
            check_out: candidate.check_out,
            exclude_reservation_id: Some(candidate.id),
        };
        let overlaps = self.reservations.iter().any(|existing| {
            existing.sub_unit_id == candidate.sub_unit_id && scope.collides_with(existing)
        });
        if overlaps {
            return Err(AppError::Conflict(
                "Reservation overlaps an existing active reservation.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-local store used when no database is configured and by tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    collision_checks: AtomicU64,
    reservation_inserts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collision_checks(&self) -> u64 {
        self.collision_checks.load(Ordering::Relaxed)
    }

    pub fn reservation_inserts(&self) -> u64 {
        self.reservation_inserts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> AppResult<()> {
        Ok(())
    }

    async fn insert_property(&self, property: NewProperty) -> AppResult<Property> {
        let mut tables = self.tables.lock().await;
        if tables
            .properties
            .iter()
            .any(|existing| existing.tourism_license == property.tourism_license)
        {
            return Err(AppError::Conflict(
                "Duplicate value violates a unique constraint.".to_string(),
            ));
        }
        let record = Property {
            id: tables.next_id(),
            public_id: property.public_id,
            name: property.name,
            address: property.address,
            city: property.city,
            province: property.province,
            tourism_license: property.tourism_license,
            capacity: property.capacity,
            created_at: Utc::now(),
        };
        tables.properties.push(record.clone());
        Ok(record)
    }

    async fn get_property(&self, id: i64) -> AppResult<Option<Property>> {
        let tables = self.tables.lock().await;
        Ok(tables.properties.iter().find(|row| row.id == id).cloned())
    }

    async fn get_property_by_public_id(&self, public_id: Uuid) -> AppResult<Option<Property>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .properties
            .iter()
            .find(|row| row.public_id == public_id)
            .cloned())
    }

    async fn list_properties(&self, limit: i64, offset: i64) -> AppResult<Vec<Property>> {
        let tables = self.tables.lock().await;
        let mut rows = tables.properties.clone();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(page(rows, limit, offset))
    }

    async fn insert_sub_unit(&self, sub_unit: NewSubUnit) -> AppResult<SubUnit> {
        let mut tables = self.tables.lock().await;
        if !tables
            .properties
            .iter()
            .any(|row| row.id == sub_unit.property_id)
        {
            return Err(AppError::NotFound("properties record not found.".to_string()));
        }
        let record = SubUnit {
            id: tables.next_id(),
            public_id: sub_unit.public_id,
            property_id: sub_unit.property_id,
            name: sub_unit.name,
            capacity: sub_unit.capacity,
            created_at: Utc::now(),
        };
        tables.sub_units.push(record.clone());
        Ok(record)
    }

    async fn get_sub_unit(&self, id: i64) -> AppResult<Option<SubUnit>> {
        let tables = self.tables.lock().await;
        Ok(tables.sub_units.iter().find(|row| row.id == id).cloned())
    }

    async fn get_sub_unit_by_public_id(&self, public_id: Uuid) -> AppResult<Option<SubUnit>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sub_units
            .iter()
            .find(|row| row.public_id == public_id)
            .cloned())
    }

    async fn list_sub_units(&self, property_id: i64) -> AppResult<Vec<SubUnit>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sub_units
            .iter()
            .filter(|row| row.property_id == property_id)
            .cloned()
            .collect())
    }

    async fn find_reservation_by_external_id(
        &self,
        external_id: &str,
    ) -> AppResult<Option<Reservation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .iter()
            .find(|row| row.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn get_reservation(&self, id: i64) -> AppResult<Option<Reservation>> {
        let tables = self.tables.lock().await;
        Ok(tables.reservations.iter().find(|row| row.id == id).cloned())
    }

    async fn get_reservation_by_public_id(
        &self,
        public_id: Uuid,
    ) -> AppResult<Option<Reservation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .iter()
            .find(|row| row.public_id == public_id)
            .cloned())
    }

    async fn count_overlapping_reservations(&self, query: &CollisionQuery) -> AppResult<i64> {
        self.collision_checks.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .iter()
            .filter(|row| query.collides_with(row))
            .count() as i64)
    }

    async fn list_active_reservations_between(
        &self,
        property_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<Reservation>> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .reservations
            .iter()
            .filter(|row| {
                row.property_id == property_id
                    && row.status.is_active()
                    && row.check_in <= to
                    && row.check_out >= from
            })
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| (row.check_in, row.id));
        Ok(rows)
    }

    async fn insert_reservation(
        &self,
        reservation: NewReservation,
        guests: Vec<NewGuest>,
        event: NewLifecycleEvent,
    ) -> AppResult<Reservation> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let record = Reservation {
            id: tables.next_id(),
            public_id: reservation.public_id,
            external_id: reservation.external_id,
            property_id: reservation.property_id,
            sub_unit_id: reservation.sub_unit_id,
            check_in: reservation.check_in,
            check_out: reservation.check_out,
            guest_count: reservation.guest_count,
            total_price: reservation.total_price,
            currency: reservation.currency,
            channel: reservation.channel,
            status: reservation.status,
            operational_status: reservation.operational_status,
            notes: reservation.notes,
            created_at: now,
            updated_at: now,
        };
        // Validate before touching any table so a failure leaves no partial rows.
        tables.check_reservation_constraints(&record)?;

        for guest in guests {
            let id = tables.next_id();
            tables.guests.push(Guest {
                id,
                public_id: guest.public_id,
                reservation_id: record.id,
                name: guest.name,
                surname: guest.surname,
                document_type: guest.document_type,
                document_number: guest.document_number,
                birth_date: guest.birth_date,
                nationality: guest.nationality,
                email: guest.email,
                phone: guest.phone,
                is_primary: guest.is_primary,
                created_at: now,
            });
        }
        let event_id = tables.next_id();
        tables.events.push(LifecycleEvent {
            id: event_id,
            public_id: event.public_id,
            reservation_id: record.id,
            kind: event.kind,
            description: event.kind.description().to_string(),
            metadata: event.metadata,
            created_at: now,
        });
        tables.reservations.push(record.clone());
        self.reservation_inserts.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    async fn update_reservation(&self, reservation: &Reservation) -> AppResult<Reservation> {
        let mut tables = self.tables.lock().await;
        let mut updated = reservation.clone();
        updated.updated_at = Utc::now();
        tables.check_reservation_constraints(&updated)?;
        let slot = tables
            .reservations
            .iter_mut()
            .find(|row| row.id == reservation.id)
            .ok_or_else(|| AppError::NotFound("reservations record not found.".to_string()))?;
        *slot = updated.clone();
        Ok(updated)
    }

    async fn set_operational_status(
        &self,
        reservation_id: i64,
        status: OperationalStatus,
    ) -> AppResult<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .reservations
            .iter_mut()
            .find(|row| row.id == reservation_id)
            .ok_or_else(|| AppError::NotFound("reservations record not found.".to_string()))?;
        row.operational_status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> AppResult<(Vec<Reservation>, i64)> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .reservations
            .iter()
            .filter(|row| filter.property_id.is_none_or(|id| row.property_id == id))
            .filter(|row| filter.check_in_from.is_none_or(|from| row.check_in >= from))
            .filter(|row| filter.check_in_to.is_none_or(|to| row.check_in <= to))
            .filter(|row| filter.status.is_none_or(|status| row.status == status))
            .filter(|row| filter.channel.is_none_or(|channel| row.channel == channel))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| (row.check_in, row.id));
        let total = rows.len() as i64;
        Ok((page(rows, filter.limit, filter.offset), total))
    }

    async fn list_guests(&self, reservation_id: i64) -> AppResult<Vec<Guest>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .guests
            .iter()
            .filter(|row| row.reservation_id == reservation_id)
            .cloned()
            .collect())
    }

    async fn insert_submission(
        &self,
        submission: NewSubmission,
    ) -> AppResult<ComplianceSubmission> {
        let mut tables = self.tables.lock().await;
        if tables
            .submissions
            .iter()
            .any(|row| row.reservation_id == submission.reservation_id)
        {
            return Err(AppError::Conflict(
                "Duplicate value violates a unique constraint.".to_string(),
            ));
        }
        let now = Utc::now();
        let record = ComplianceSubmission {
            id: tables.next_id(),
            public_id: submission.public_id,
            reservation_id: submission.reservation_id,
            state: SubmissionState::Pending,
            attempts: 0,
            max_attempts: submission.max_attempts,
            next_retry_at: Some(submission.next_retry_at),
            reference: None,
            rejection_reason: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.submissions.push(record.clone());
        Ok(record)
    }

    async fn get_submission(&self, id: i64) -> AppResult<Option<ComplianceSubmission>> {
        let tables = self.tables.lock().await;
        Ok(tables.submissions.iter().find(|row| row.id == id).cloned())
    }

    async fn find_submission_for_reservation(
        &self,
        reservation_id: i64,
    ) -> AppResult<Option<ComplianceSubmission>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .submissions
            .iter()
            .find(|row| row.reservation_id == reservation_id)
            .cloned())
    }

    async fn update_submission(&self, submission: &ComplianceSubmission) -> AppResult<()> {
        let mut tables = self.tables.lock().await;
        let slot = tables
            .submissions
            .iter_mut()
            .find(|row| row.id == submission.id)
            .ok_or_else(|| {
                AppError::NotFound("compliance_submissions record not found.".to_string())
            })?;
        *slot = submission.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_submissions(
        &self,
        filter: &SubmissionFilter,
    ) -> AppResult<Vec<ComplianceSubmission>> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .submissions
            .iter()
            .filter(|row| {
                filter.property_id.is_none_or(|property_id| {
                    tables.reservations.iter().any(|reservation| {
                        reservation.id == row.reservation_id
                            && reservation.property_id == property_id
                    })
                })
            })
            .filter(|row| filter.created_from.is_none_or(|from| row.created_at >= from))
            .filter(|row| filter.created_to.is_none_or(|to| row.created_at <= to))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> AppResult<SubmissionAttempt> {
        let mut tables = self.tables.lock().await;
        let record = SubmissionAttempt {
            id: tables.next_id(),
            submission_id: attempt.submission_id,
            attempted_at: Utc::now(),
            outcome: attempt.outcome,
            response_code: attempt.response_code,
            response_message: attempt.response_message,
            request_hash: attempt.request_hash,
            response_hash: attempt.response_hash,
        };
        tables.attempts.push(record.clone());
        Ok(record)
    }

    async fn latest_attempt(&self, submission_id: i64) -> AppResult<Option<SubmissionAttempt>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .attempts
            .iter()
            .filter(|row| row.submission_id == submission_id)
            .max_by_key(|row| row.id)
            .cloned())
    }

    async fn update_attempt(&self, attempt: &SubmissionAttempt) -> AppResult<()> {
        let mut tables = self.tables.lock().await;
        let slot = tables
            .attempts
            .iter_mut()
            .find(|row| row.id == attempt.id)
            .ok_or_else(|| {
                AppError::NotFound("submission_attempts record not found.".to_string())
            })?;
        *slot = attempt.clone();
        Ok(())
    }

    async fn list_attempts(&self, submission_id: i64) -> AppResult<Vec<SubmissionAttempt>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .attempts
            .iter()
            .filter(|row| row.submission_id == submission_id)
            .cloned()
            .collect())
    }

    async fn append_event(
        &self,
        reservation_id: i64,
        event: NewLifecycleEvent,
    ) -> AppResult<LifecycleEvent> {
        let mut tables = self.tables.lock().await;
        let record = LifecycleEvent {
            id: tables.next_id(),
            public_id: event.public_id,
            reservation_id,
            kind: event.kind,
            description: event.kind.description().to_string(),
            metadata: event.metadata,
            created_at: Utc::now(),
        };
        tables.events.push(record.clone());
        Ok(record)
    }

    async fn list_events(&self, reservation_id: i64) -> AppResult<Vec<LifecycleEvent>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .events
            .iter()
            .filter(|row| row.reservation_id == reservation_id)
            .cloned()
            .collect())
    }
}

fn page<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    rows.into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.clamp(1, 1000) as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::MemoryStore;
    use crate::{
        error::AppError,
        models::{
            new_public_id, Channel, LifecycleEventKind, NewLifecycleEvent, NewProperty,
            NewReservation, OperationalStatus, ReservationStatus,
        },
        repository::Store,
    };

    async fn seed_property(store: &MemoryStore) -> i64 {
        store
            .insert_property(NewProperty {
                public_id: new_public_id(),
                name: "Casa Azul".to_string(),
                address: "Calle Mayor 1".to_string(),
                city: "Sevilla".to_string(),
                province: "Sevilla".to_string(),
                tourism_license: "VFT/SE/00001".to_string(),
                capacity: 4,
            })
            .await
            .expect("property")
            .id
    }

    fn new_reservation(property_id: i64, check_in: &str, check_out: &str) -> NewReservation {
        NewReservation {
            public_id: new_public_id(),
            external_id: None,
            property_id,
            sub_unit_id: None,
            check_in: check_in.parse().expect("date"),
            check_out: check_out.parse().expect("date"),
            guest_count: 2,
            total_price: 100.0,
            currency: "EUR".to_string(),
            channel: Channel::Direct,
            status: ReservationStatus::Created,
            operational_status: OperationalStatus::Created,
            notes: None,
        }
    }

    fn created_event() -> NewLifecycleEvent {
        NewLifecycleEvent {
            public_id: new_public_id(),
            kind: LifecycleEventKind::ReservationCreated,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn overlap_constraint_rejects_concurrent_style_insert() {
        let store = MemoryStore::new();
        let property_id = seed_property(&store).await;
        store
            .insert_reservation(
                new_reservation(property_id, "2024-06-15", "2024-06-20"),
                Vec::new(),
                created_event(),
            )
            .await
            .expect("first insert");

        let error = store
            .insert_reservation(
                new_reservation(property_id, "2024-06-19", "2024-06-21"),
                Vec::new(),
                created_event(),
            )
            .await
            .expect_err("overlap must be rejected");
        assert!(matches!(error, AppError::Conflict(_)));
        assert_eq!(store.reservation_inserts(), 1);

        let back_to_back = store
            .insert_reservation(
                new_reservation(property_id, "2024-06-20", "2024-06-22"),
                Vec::new(),
                created_event(),
            )
            .await;
        assert!(back_to_back.is_ok());
    }

    #[tokio::test]
    async fn failed_insert_leaves_no_events_behind() {
        let store = MemoryStore::new();
        let property_id = seed_property(&store).await;
        let mut first = new_reservation(property_id, "2024-06-01", "2024-06-03");
        first.external_id = Some("dup".to_string());
        let created = store
            .insert_reservation(first, Vec::new(), created_event())
            .await
            .expect("insert");

        let mut second = new_reservation(property_id, "2024-07-01", "2024-07-03");
        second.external_id = Some("dup".to_string());
        assert!(store
            .insert_reservation(second, Vec::new(), created_event())
            .await
            .is_err());

        let events = store.list_events(created.id).await.expect("events");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_tourism_license_is_a_conflict() {
        let store = MemoryStore::new();
        seed_property(&store).await;
        let error = store
            .insert_property(NewProperty {
                public_id: new_public_id(),
                name: "Otra".to_string(),
                address: "Calle 2".to_string(),
                city: "Sevilla".to_string(),
                province: "Sevilla".to_string(),
                tourism_license: "VFT/SE/00001".to_string(),
                capacity: 2,
            })
            .await
            .expect_err("duplicate license");
        assert!(error.is_conflict());
    }
}
