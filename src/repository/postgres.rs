use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::Store;
use crate::{
    error::{AppError, AppResult},
    models::{
        AttemptOutcome, Channel, CollisionQuery, ComplianceSubmission, DocumentType, Guest,
        LifecycleEvent, LifecycleEventKind, NewAttempt, NewGuest, NewLifecycleEvent, NewProperty,
        NewReservation, NewSubUnit, NewSubmission, OperationalStatus, Property, Reservation,
        ReservationFilter, ReservationStatus, SubUnit, SubmissionAttempt, SubmissionFilter,
        SubmissionState,
    },
};

const RESERVATION_COLUMNS: &str = "id, public_id, external_id, property_id, sub_unit_id, \
     check_in, check_out, guest_count, total_price, currency, channel, status, \
     operational_status, notes, created_at, updated_at";

const SUBMISSION_COLUMNS: &str = "id, public_id, reservation_id, state, attempts, max_attempts, \
     next_retry_at, reference, rejection_reason, sent_at, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, submission_id, attempted_at, outcome, response_code, \
     response_message, request_hash, response_hash";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend_tag(&self) -> &'static str {
        "postgres"
    }

    async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_db_error)
    }

    async fn insert_property(&self, property: NewProperty) -> AppResult<Property> {
        let row = sqlx::query(
            r#"
            INSERT INTO properties
              (public_id, name, address, city, province, tourism_license, capacity)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, public_id, name, address, city, province, tourism_license,
                      capacity, created_at
            "#,
        )
        .bind(property.public_id)
        .bind(&property.name)
        .bind(&property.address)
        .bind(&property.city)
        .bind(&property.province)
        .bind(&property.tourism_license)
        .bind(property.capacity)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        property_from_row(&row)
    }

    async fn get_property(&self, id: i64) -> AppResult<Option<Property>> {
        let row = sqlx::query(
            "SELECT id, public_id, name, address, city, province, tourism_license, capacity, \
             created_at FROM properties WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(property_from_row).transpose()
    }

    async fn get_property_by_public_id(&self, public_id: Uuid) -> AppResult<Option<Property>> {
        let row = sqlx::query(
            "SELECT id, public_id, name, address, city, province, tourism_license, capacity, \
             created_at FROM properties WHERE public_id = $1",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(property_from_row).transpose()
    }

    async fn list_properties(&self, limit: i64, offset: i64) -> AppResult<Vec<Property>> {
        let rows = sqlx::query(
            "SELECT id, public_id, name, address, city, province, tourism_license, capacity, \
             created_at FROM properties ORDER BY name ASC, id ASC LIMIT $1 OFFSET $2",
        )
        .bind(limit.clamp(1, 1000))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(property_from_row).collect()
    }

    async fn insert_sub_unit(&self, sub_unit: NewSubUnit) -> AppResult<SubUnit> {
        let row = sqlx::query(
            r#"
            INSERT INTO sub_units (public_id, property_id, name, capacity)
            VALUES ($1, $2, $3, $4)
            RETURNING id, public_id, property_id, name, capacity, created_at
            "#,
        )
        .bind(sub_unit.public_id)
        .bind(sub_unit.property_id)
        .bind(&sub_unit.name)
        .bind(sub_unit.capacity)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        sub_unit_from_row(&row)
    }

    async fn get_sub_unit(&self, id: i64) -> AppResult<Option<SubUnit>> {
        let row = sqlx::query(
            "SELECT id, public_id, property_id, name, capacity, created_at \
             FROM sub_units WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(sub_unit_from_row).transpose()
    }

    async fn get_sub_unit_by_public_id(&self, public_id: Uuid) -> AppResult<Option<SubUnit>> {
        let row = sqlx::query(
            "SELECT id, public_id, property_id, name, capacity, created_at \
             FROM sub_units WHERE public_id = $1",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(sub_unit_from_row).transpose()
    }

    async fn list_sub_units(&self, property_id: i64) -> AppResult<Vec<SubUnit>> {
        let rows = sqlx::query(
            "SELECT id, public_id, property_id, name, capacity, created_at \
             FROM sub_units WHERE property_id = $1 ORDER BY name ASC, id ASC",
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(sub_unit_from_row).collect()
    }

    async fn find_reservation_by_external_id(
        &self,
        external_id: &str,
    ) -> AppResult<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn get_reservation(&self, id: i64) -> AppResult<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn get_reservation_by_public_id(
        &self,
        public_id: Uuid,
    ) -> AppResult<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE public_id = $1"
        ))
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn count_overlapping_reservations(&self, query: &CollisionQuery) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM reservations
            WHERE property_id = $1
              AND status <> 'cancelled'
              AND ($2::bigint IS NULL OR sub_unit_id IS NULL OR sub_unit_id = $2)
              AND ($5::bigint IS NULL OR id <> $5)
              AND check_in < $4
              AND check_out > $3
            "#,
        )
        .bind(query.property_id)
        .bind(query.sub_unit_id)
        .bind(query.check_in)
        .bind(query.check_out)
        .bind(query.exclude_reservation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)
    }

    async fn list_active_reservations_between(
        &self,
        property_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE property_id = $1 AND status <> 'cancelled' \
               AND check_in <= $3 AND check_out >= $2 \
             ORDER BY check_in ASC, id ASC"
        ))
        .bind(property_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn insert_reservation(
        &self,
        reservation: NewReservation,
        guests: Vec<NewGuest>,
        event: NewLifecycleEvent,
    ) -> AppResult<Reservation> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO reservations
              (public_id, external_id, property_id, sub_unit_id, check_in, check_out,
               guest_count, total_price, currency, channel, status, operational_status, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(reservation.public_id)
        .bind(&reservation.external_id)
        .bind(reservation.property_id)
        .bind(reservation.sub_unit_id)
        .bind(reservation.check_in)
        .bind(reservation.check_out)
        .bind(reservation.guest_count)
        .bind(reservation.total_price)
        .bind(&reservation.currency)
        .bind(reservation.channel.as_str())
        .bind(reservation.status.as_str())
        .bind(reservation.operational_status.as_str())
        .bind(&reservation.notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        let created = reservation_from_row(&row)?;

        for guest in &guests {
            sqlx::query(
                r#"
                INSERT INTO guests
                  (public_id, reservation_id, name, surname, document_type, document_number,
                   birth_date, nationality, email, phone, is_primary)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(guest.public_id)
            .bind(created.id)
            .bind(&guest.name)
            .bind(&guest.surname)
            .bind(guest.document_type.as_str())
            .bind(&guest.document_number)
            .bind(guest.birth_date)
            .bind(&guest.nationality)
            .bind(&guest.email)
            .bind(&guest.phone)
            .bind(guest.is_primary)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        }

        sqlx::query(
            r#"
            INSERT INTO lifecycle_events (public_id, reservation_id, kind, description, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.public_id)
        .bind(created.id)
        .bind(event.kind.as_str())
        .bind(event.kind.description())
        .bind(&event.metadata)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;
        Ok(created)
    }

    async fn update_reservation(&self, reservation: &Reservation) -> AppResult<Reservation> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE reservations
            SET sub_unit_id = $2,
                check_in = $3,
                check_out = $4,
                guest_count = $5,
                total_price = $6,
                currency = $7,
                channel = $8,
                status = $9,
                operational_status = $10,
                notes = $11,
                updated_at = now()
            WHERE id = $1
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(reservation.id)
        .bind(reservation.sub_unit_id)
        .bind(reservation.check_in)
        .bind(reservation.check_out)
        .bind(reservation.guest_count)
        .bind(reservation.total_price)
        .bind(&reservation.currency)
        .bind(reservation.channel.as_str())
        .bind(reservation.status.as_str())
        .bind(reservation.operational_status.as_str())
        .bind(&reservation.notes)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("reservations record not found.".to_string()))?;
        reservation_from_row(&row)
    }

    async fn set_operational_status(
        &self,
        reservation_id: i64,
        status: OperationalStatus,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE reservations SET operational_status = $2, updated_at = now() WHERE id = $1",
        )
        .bind(reservation_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(
                "reservations record not found.".to_string(),
            ));
        }
        Ok(())
    }

    async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> AppResult<(Vec<Reservation>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM reservations");
        push_reservation_filters(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;

        let mut query =
            QueryBuilder::<Postgres>::new(format!("SELECT {RESERVATION_COLUMNS} FROM reservations"));
        push_reservation_filters(&mut query, filter);
        query
            .push(" ORDER BY check_in ASC, id ASC LIMIT ")
            .push_bind(filter.limit.clamp(1, 1000))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        let reservations = rows
            .iter()
            .map(reservation_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        Ok((reservations, total))
    }

    async fn list_guests(&self, reservation_id: i64) -> AppResult<Vec<Guest>> {
        let rows = sqlx::query(
            r#"
            SELECT id, public_id, reservation_id, name, surname, document_type, document_number,
                   birth_date, nationality, email, phone, is_primary, created_at
            FROM guests
            WHERE reservation_id = $1
            ORDER BY is_primary DESC, id ASC
            "#,
        )
        .bind(reservation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(guest_from_row).collect()
    }

    async fn insert_submission(
        &self,
        submission: NewSubmission,
    ) -> AppResult<ComplianceSubmission> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO compliance_submissions
              (public_id, reservation_id, state, attempts, max_attempts, next_retry_at)
            VALUES ($1, $2, 'pending', 0, $3, $4)
            RETURNING {SUBMISSION_COLUMNS}
            "#
        ))
        .bind(submission.public_id)
        .bind(submission.reservation_id)
        .bind(submission.max_attempts)
        .bind(submission.next_retry_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        submission_from_row(&row)
    }

    async fn get_submission(&self, id: i64) -> AppResult<Option<ComplianceSubmission>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM compliance_submissions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(submission_from_row).transpose()
    }

    async fn find_submission_for_reservation(
        &self,
        reservation_id: i64,
    ) -> AppResult<Option<ComplianceSubmission>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM compliance_submissions WHERE reservation_id = $1"
        ))
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(submission_from_row).transpose()
    }

    async fn update_submission(&self, submission: &ComplianceSubmission) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE compliance_submissions
            SET state = $2,
                attempts = $3,
                next_retry_at = $4,
                reference = $5,
                rejection_reason = $6,
                sent_at = $7,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(submission.id)
        .bind(submission.state.as_str())
        .bind(submission.attempts)
        .bind(submission.next_retry_at)
        .bind(&submission.reference)
        .bind(&submission.rejection_reason)
        .bind(submission.sent_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_db_error)
    }

    async fn list_submissions(
        &self,
        filter: &SubmissionFilter,
    ) -> AppResult<Vec<ComplianceSubmission>> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT s.id, s.public_id, s.reservation_id, s.state, s.attempts, s.max_attempts, \
             s.next_retry_at, s.reference, s.rejection_reason, s.sent_at, s.created_at, \
             s.updated_at FROM compliance_submissions s \
             JOIN reservations r ON r.id = s.reservation_id WHERE 1 = 1",
        );
        if let Some(property_id) = filter.property_id {
            query.push(" AND r.property_id = ").push_bind(property_id);
        }
        if let Some(from) = filter.created_from {
            query.push(" AND s.created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.created_to {
            query.push(" AND s.created_at <= ").push_bind(to);
        }
        query.push(" ORDER BY s.created_at DESC, s.id DESC");
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        rows.iter().map(submission_from_row).collect()
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> AppResult<SubmissionAttempt> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO submission_attempts
              (submission_id, outcome, response_code, response_message, request_hash,
               response_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(attempt.submission_id)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.response_code)
        .bind(&attempt.response_message)
        .bind(&attempt.request_hash)
        .bind(&attempt.response_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        attempt_from_row(&row)
    }

    async fn latest_attempt(&self, submission_id: i64) -> AppResult<Option<SubmissionAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM submission_attempts \
             WHERE submission_id = $1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn update_attempt(&self, attempt: &SubmissionAttempt) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE submission_attempts
            SET outcome = $2,
                response_code = $3,
                response_message = $4,
                response_hash = $5
            WHERE id = $1
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.response_code)
        .bind(&attempt.response_message)
        .bind(&attempt.response_hash)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_db_error)
    }

    async fn list_attempts(&self, submission_id: i64) -> AppResult<Vec<SubmissionAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM submission_attempts \
             WHERE submission_id = $1 ORDER BY id ASC"
        ))
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn append_event(
        &self,
        reservation_id: i64,
        event: NewLifecycleEvent,
    ) -> AppResult<LifecycleEvent> {
        let row = sqlx::query(
            r#"
            INSERT INTO lifecycle_events (public_id, reservation_id, kind, description, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, public_id, reservation_id, kind, description, metadata, created_at
            "#,
        )
        .bind(event.public_id)
        .bind(reservation_id)
        .bind(event.kind.as_str())
        .bind(event.kind.description())
        .bind(&event.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        event_from_row(&row)
    }

    async fn list_events(&self, reservation_id: i64) -> AppResult<Vec<LifecycleEvent>> {
        let rows = sqlx::query(
            "SELECT id, public_id, reservation_id, kind, description, metadata, created_at \
             FROM lifecycle_events WHERE reservation_id = $1 ORDER BY id ASC",
        )
        .bind(reservation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(event_from_row).collect()
    }
}

fn push_reservation_filters(query: &mut QueryBuilder<'_, Postgres>, filter: &ReservationFilter) {
    query.push(" WHERE 1 = 1");
    if let Some(property_id) = filter.property_id {
        query.push(" AND property_id = ").push_bind(property_id);
    }
    if let Some(from) = filter.check_in_from {
        query.push(" AND check_in >= ").push_bind(from);
    }
    if let Some(to) = filter.check_in_to {
        query.push(" AND check_in <= ").push_bind(to);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(channel) = filter.channel {
        query.push(" AND channel = ").push_bind(channel.as_str());
    }
}

fn property_from_row(row: &PgRow) -> AppResult<Property> {
    Ok(Property {
        id: row.try_get("id").map_err(map_db_error)?,
        public_id: row.try_get("public_id").map_err(map_db_error)?,
        name: row.try_get("name").map_err(map_db_error)?,
        address: row.try_get("address").map_err(map_db_error)?,
        city: row.try_get("city").map_err(map_db_error)?,
        province: row.try_get("province").map_err(map_db_error)?,
        tourism_license: row.try_get("tourism_license").map_err(map_db_error)?,
        capacity: row.try_get("capacity").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
    })
}

fn sub_unit_from_row(row: &PgRow) -> AppResult<SubUnit> {
    Ok(SubUnit {
        id: row.try_get("id").map_err(map_db_error)?,
        public_id: row.try_get("public_id").map_err(map_db_error)?,
        property_id: row.try_get("property_id").map_err(map_db_error)?,
        name: row.try_get("name").map_err(map_db_error)?,
        capacity: row.try_get("capacity").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
    })
}

fn reservation_from_row(row: &PgRow) -> AppResult<Reservation> {
    Ok(Reservation {
        id: row.try_get("id").map_err(map_db_error)?,
        public_id: row.try_get("public_id").map_err(map_db_error)?,
        external_id: row.try_get("external_id").map_err(map_db_error)?,
        property_id: row.try_get("property_id").map_err(map_db_error)?,
        sub_unit_id: row.try_get("sub_unit_id").map_err(map_db_error)?,
        check_in: row.try_get("check_in").map_err(map_db_error)?,
        check_out: row.try_get("check_out").map_err(map_db_error)?,
        guest_count: row.try_get("guest_count").map_err(map_db_error)?,
        total_price: row.try_get("total_price").map_err(map_db_error)?,
        currency: row.try_get("currency").map_err(map_db_error)?,
        channel: text_column(row, "channel", Channel::parse)?,
        status: text_column(row, "status", ReservationStatus::parse)?,
        operational_status: text_column(row, "operational_status", OperationalStatus::parse)?,
        notes: row.try_get("notes").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
        updated_at: row.try_get("updated_at").map_err(map_db_error)?,
    })
}

fn guest_from_row(row: &PgRow) -> AppResult<Guest> {
    Ok(Guest {
        id: row.try_get("id").map_err(map_db_error)?,
        public_id: row.try_get("public_id").map_err(map_db_error)?,
        reservation_id: row.try_get("reservation_id").map_err(map_db_error)?,
        name: row.try_get("name").map_err(map_db_error)?,
        surname: row.try_get("surname").map_err(map_db_error)?,
        document_type: text_column(row, "document_type", DocumentType::parse)?,
        document_number: row.try_get("document_number").map_err(map_db_error)?,
        birth_date: row.try_get("birth_date").map_err(map_db_error)?,
        nationality: row.try_get("nationality").map_err(map_db_error)?,
        email: row.try_get("email").map_err(map_db_error)?,
        phone: row.try_get("phone").map_err(map_db_error)?,
        is_primary: row.try_get("is_primary").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
    })
}

fn submission_from_row(row: &PgRow) -> AppResult<ComplianceSubmission> {
    Ok(ComplianceSubmission {
        id: row.try_get("id").map_err(map_db_error)?,
        public_id: row.try_get("public_id").map_err(map_db_error)?,
        reservation_id: row.try_get("reservation_id").map_err(map_db_error)?,
        state: text_column(row, "state", SubmissionState::parse)?,
        attempts: row.try_get("attempts").map_err(map_db_error)?,
        max_attempts: row.try_get("max_attempts").map_err(map_db_error)?,
        next_retry_at: row.try_get("next_retry_at").map_err(map_db_error)?,
        reference: row.try_get("reference").map_err(map_db_error)?,
        rejection_reason: row.try_get("rejection_reason").map_err(map_db_error)?,
        sent_at: row.try_get("sent_at").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
        updated_at: row.try_get("updated_at").map_err(map_db_error)?,
    })
}

fn attempt_from_row(row: &PgRow) -> AppResult<SubmissionAttempt> {
    Ok(SubmissionAttempt {
        id: row.try_get("id").map_err(map_db_error)?,
        submission_id: row.try_get("submission_id").map_err(map_db_error)?,
        attempted_at: row.try_get("attempted_at").map_err(map_db_error)?,
        outcome: text_column(row, "outcome", AttemptOutcome::parse)?,
        response_code: row.try_get("response_code").map_err(map_db_error)?,
        response_message: row.try_get("response_message").map_err(map_db_error)?,
        request_hash: row.try_get("request_hash").map_err(map_db_error)?,
        response_hash: row.try_get("response_hash").map_err(map_db_error)?,
    })
}

fn event_from_row(row: &PgRow) -> AppResult<LifecycleEvent> {
    Ok(LifecycleEvent {
        id: row.try_get("id").map_err(map_db_error)?,
        public_id: row.try_get("public_id").map_err(map_db_error)?,
        reservation_id: row.try_get("reservation_id").map_err(map_db_error)?,
        kind: text_column(row, "kind", LifecycleEventKind::parse)?,
        description: row.try_get("description").map_err(map_db_error)?,
        metadata: row.try_get("metadata").map_err(map_db_error)?,
        created_at: row.try_get("created_at").map_err(map_db_error)?,
    })
}

fn text_column<T>(row: &PgRow, column: &str, parse: fn(&str) -> Option<T>) -> AppResult<T> {
    let raw: String = row.try_get(column).map_err(map_db_error)?;
    parse(&raw).ok_or_else(|| {
        tracing::error!(column, value = %raw, "Unexpected enum value in database");
        AppError::Internal(format!("Unexpected value for {column}."))
    })
}

pub(crate) fn map_db_error(error: sqlx::Error) -> AppError {
    let code = error
        .as_database_error()
        .and_then(|db_error| db_error.code())
        .map(|code| code.into_owned());
    tracing::error!(db_error = %error, code = code.as_deref().unwrap_or(""), "Database query failed");

    match code.as_deref() {
        Some("23505") => {
            AppError::Conflict("Duplicate value violates a unique constraint.".to_string())
        }
        Some("23P01") => AppError::Conflict(
            "Reservation overlaps an existing active reservation.".to_string(),
        ),
        Some("23503") => AppError::NotFound("Referenced record not found.".to_string()),
        Some("23514") => AppError::UnprocessableEntity(
            "Value violates a check constraint.".to_string(),
        ),
        _ => AppError::Dependency("Database operation failed.".to_string()),
    }
}
