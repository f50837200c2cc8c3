use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        new_public_id, Channel, ComplianceSubmission, DocumentType, Guest, LifecycleEventKind,
        NewGuest, NewReservation, OperationalStatus, Reservation, ReservationFilter,
        ReservationStatus, SubUnit, SubmissionState,
    },
    repository::Store,
    schemas::{
        clamp_limit_in_range, CreateReservationInput, GuestInput, ImportCalendarInput,
        ReservationsQuery, UpdateReservationInput,
    },
    services::{
        audit::lifecycle_event,
        calendar::CalendarService,
        compliance::ComplianceService,
        ical::{import_candidates, validate_feed_url, CalendarFeedSource},
    },
};

#[derive(Debug, Clone, Serialize)]
pub struct NamedRef {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuestView {
    pub id: Uuid,
    pub name: String,
    pub surname: String,
    pub document_type: DocumentType,
    pub nationality: Option<String>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionView {
    pub id: Uuid,
    pub state: SubmissionState,
    pub reference: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub rejection_reason: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationView {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub property: NamedRef,
    pub sub_unit: Option<NamedRef>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub nights: i64,
    pub average_nightly_price: f64,
    pub guest_count: i32,
    pub total_price: f64,
    pub currency: String,
    pub channel: Channel,
    pub status: ReservationStatus,
    pub operational_status: OperationalStatus,
    pub notes: Option<String>,
    pub guests: Vec<GuestView>,
    pub compliance_submissions: Vec<SubmissionView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationPage {
    pub data: Vec<ReservationView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub total: usize,
}

/// Result of `create`; `replayed` marks an idempotent hit on `external_id`.
#[derive(Debug, Clone)]
pub struct CreatedReservation {
    pub reservation: Reservation,
    pub replayed: bool,
}

#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn Store>,
    calendar: CalendarService,
    compliance: ComplianceService,
    feeds: Arc<dyn CalendarFeedSource>,
    default_currency: String,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn Store>,
        calendar: CalendarService,
        compliance: ComplianceService,
        feeds: Arc<dyn CalendarFeedSource>,
        default_currency: &str,
    ) -> Self {
        Self {
            store,
            calendar,
            compliance,
            feeds,
            default_currency: default_currency.to_ascii_uppercase(),
        }
    }

    pub async fn create(&self, input: CreateReservationInput) -> AppResult<CreatedReservation> {
        let external_id = input
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);

        if let Some(external_id) = external_id.as_deref() {
            if let Some(existing) = self.store.find_reservation_by_external_id(external_id).await? {
                tracing::debug!(reservation_id = %existing.public_id, "Idempotent reservation replay");
                return Ok(CreatedReservation {
                    reservation: existing,
                    replayed: true,
                });
            }
        }

        ensure_date_order(input.check_in, input.check_out)?;

        let property = self
            .store
            .get_property_by_public_id(input.property_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Property not found.".to_string()))?;
        let sub_unit = match input.sub_unit_id {
            Some(public_id) => Some(self.require_sub_unit(property.id, public_id).await?),
            None => None,
        };
        let sub_unit_id = sub_unit.as_ref().map(|unit| unit.id);

        if self
            .calendar
            .check_collision(property.id, sub_unit_id, input.check_in, input.check_out, None)
            .await?
        {
            return Err(AppError::Conflict(
                "Reservation overlaps an existing active reservation.".to_string(),
            ));
        }

        let guests = assign_primary_guest(input.guests);
        let has_guests = !guests.is_empty();
        let channel = input.channel.unwrap_or(Channel::Direct);
        let new_reservation = NewReservation {
            public_id: new_public_id(),
            external_id: external_id.clone(),
            property_id: property.id,
            sub_unit_id,
            check_in: input.check_in,
            check_out: input.check_out,
            guest_count: input.guest_count,
            total_price: input.total_price,
            currency: input
                .currency
                .map(|value| value.trim().to_ascii_uppercase())
                .unwrap_or_else(|| self.default_currency.clone()),
            channel,
            status: ReservationStatus::Created,
            operational_status: if has_guests {
                OperationalStatus::DataComplete
            } else {
                OperationalStatus::Created
            },
            notes: input.notes,
        };
        let event = lifecycle_event(
            LifecycleEventKind::ReservationCreated,
            json!({
                "channel": channel.as_str(),
                "check_in": input.check_in,
                "check_out": input.check_out,
                "guest_count": input.guest_count,
                "registered_guests": guests.len(),
            }),
        );

        let reservation = match self
            .store
            .insert_reservation(new_reservation, guests, event)
            .await
        {
            Ok(reservation) => reservation,
            Err(error) if error.is_conflict() => {
                // A concurrent request with the same external id may have won the race.
                if let Some(external_id) = external_id.as_deref() {
                    if let Some(existing) =
                        self.store.find_reservation_by_external_id(external_id).await?
                    {
                        return Ok(CreatedReservation {
                            reservation: existing,
                            replayed: true,
                        });
                    }
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        tracing::info!(
            reservation_id = %reservation.public_id,
            channel = channel.as_str(),
            nights = reservation.nights(),
            "Reservation created"
        );

        if has_guests {
            if let Err(error) = self
                .compliance
                .create_submission(reservation.id, external_id.as_deref())
                .await
            {
                tracing::warn!(
                    reservation_id = %reservation.public_id,
                    error = %error,
                    "Could not schedule compliance submission"
                );
            }
        }

        Ok(CreatedReservation {
            reservation,
            replayed: false,
        })
    }

    pub async fn get(&self, public_id: Uuid) -> AppResult<ReservationView> {
        let reservation = self.require_reservation(public_id).await?;
        self.view(&reservation).await
    }

    pub async fn update(
        &self,
        public_id: Uuid,
        input: UpdateReservationInput,
    ) -> AppResult<Reservation> {
        let current = self.require_reservation(public_id).await?;
        let mut next = current.clone();

        if let Some(status) = input.status {
            next.status = checked_transition(current.status, status)?;
        }

        let check_in = input.check_in.unwrap_or(current.check_in);
        let check_out = input.check_out.unwrap_or(current.check_out);
        let dates_changed = check_in != current.check_in || check_out != current.check_out;
        if dates_changed {
            ensure_date_order(check_in, check_out)?;
            if next.status.is_active()
                && self
                    .calendar
                    .check_collision(
                        current.property_id,
                        current.sub_unit_id,
                        check_in,
                        check_out,
                        Some(current.id),
                    )
                    .await?
            {
                return Err(AppError::Conflict(
                    "Reservation overlaps an existing active reservation.".to_string(),
                ));
            }
            next.check_in = check_in;
            next.check_out = check_out;
        }

        if let Some(guest_count) = input.guest_count {
            next.guest_count = guest_count;
        }
        if let Some(total_price) = input.total_price {
            next.total_price = total_price;
        }
        if let Some(currency) = input.currency {
            next.currency = currency.trim().to_ascii_uppercase();
        }
        if let Some(notes) = input.notes {
            next.notes = Some(notes);
        }

        if next == current {
            return Ok(current);
        }
        let updated = self.store.update_reservation(&next).await?;
        self.after_status_change(&current, &updated).await?;
        Ok(updated)
    }

    pub async fn transition_status(
        &self,
        public_id: Uuid,
        status: ReservationStatus,
    ) -> AppResult<Reservation> {
        let current = self.require_reservation(public_id).await?;
        let target = checked_transition(current.status, status)?;
        if target == current.status {
            return Ok(current);
        }
        let mut next = current.clone();
        next.status = target;
        let updated = self.store.update_reservation(&next).await?;
        self.after_status_change(&current, &updated).await?;
        Ok(updated)
    }

    pub async fn find_all(&self, query: ReservationsQuery) -> AppResult<ReservationPage> {
        let property_id = match query.property_id {
            Some(public_id) => Some(
                self.store
                    .get_property_by_public_id(public_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound("Property not found.".to_string()))?
                    .id,
            ),
            None => None,
        };
        let limit = clamp_limit_in_range(query.limit, 1, 500);
        let offset = query.offset.max(0);
        let (rows, total) = self
            .store
            .list_reservations(&ReservationFilter {
                property_id,
                check_in_from: query.check_in_from,
                check_in_to: query.check_in_to,
                status: query.status,
                channel: query.channel,
                limit,
                offset,
            })
            .await?;

        let mut data = Vec::with_capacity(rows.len());
        for reservation in &rows {
            data.push(self.view(reservation).await?);
        }
        Ok(ReservationPage {
            data,
            total,
            limit,
            offset,
        })
    }

    pub async fn import_from_external_calendar(
        &self,
        input: ImportCalendarInput,
    ) -> AppResult<ImportSummary> {
        let url = validate_feed_url(&input.feed_url)?;
        let property = self
            .store
            .get_property_by_public_id(input.property_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Property not found.".to_string()))?;
        let channel = input.channel.unwrap_or(Channel::IcalImport);

        let text = self.feeds.fetch(&url).await?;
        let candidates = import_candidates(&text, channel);
        let mut summary = ImportSummary {
            total: candidates.len(),
            ..ImportSummary::default()
        };

        for candidate in candidates {
            let result = self
                .create(CreateReservationInput {
                    external_id: Some(candidate.external_id.clone()),
                    property_id: property.public_id,
                    sub_unit_id: None,
                    check_in: candidate.check_in,
                    check_out: candidate.check_out,
                    guest_count: 1,
                    total_price: 0.0,
                    currency: None,
                    channel: Some(channel),
                    notes: (!candidate.summary.is_empty()).then(|| candidate.summary.clone()),
                    guests: Vec::new(),
                })
                .await;
            match result {
                Ok(created) if created.replayed => summary.skipped += 1,
                Ok(_) => summary.imported += 1,
                Err(error) if error.is_conflict() => summary.skipped += 1,
                Err(error) => summary
                    .errors
                    .push(format!("{}: {}", candidate.external_id, error.detail_message())),
            }
        }

        tracing::info!(
            property_id = %property.public_id,
            channel = channel.as_str(),
            imported = summary.imported,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "Calendar import finished"
        );
        Ok(summary)
    }

    pub async fn view(&self, reservation: &Reservation) -> AppResult<ReservationView> {
        let property = self
            .store
            .get_property(reservation.property_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Property not found.".to_string()))?;
        let sub_unit = match reservation.sub_unit_id {
            Some(id) => self.store.get_sub_unit(id).await?,
            None => None,
        };
        let guests = self.store.list_guests(reservation.id).await?;
        let submissions = self
            .store
            .find_submission_for_reservation(reservation.id)
            .await?
            .into_iter()
            .map(submission_view)
            .collect();

        Ok(ReservationView {
            id: reservation.public_id,
            external_id: reservation.external_id.clone(),
            property: NamedRef {
                id: property.public_id,
                name: property.name,
            },
            sub_unit: sub_unit.map(|unit| NamedRef {
                id: unit.public_id,
                name: unit.name,
            }),
            check_in: reservation.check_in,
            check_out: reservation.check_out,
            nights: reservation.nights(),
            average_nightly_price: reservation.average_nightly_price(),
            guest_count: reservation.guest_count,
            total_price: reservation.total_price,
            currency: reservation.currency.clone(),
            channel: reservation.channel,
            status: reservation.status,
            operational_status: reservation.operational_status,
            notes: reservation.notes.clone(),
            guests: guests.into_iter().map(guest_view).collect(),
            compliance_submissions: submissions,
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
        })
    }

    async fn after_status_change(&self, before: &Reservation, after: &Reservation) -> AppResult<()> {
        if before.status == after.status {
            return Ok(());
        }
        tracing::info!(
            reservation_id = %after.public_id,
            from = before.status.as_str(),
            to = after.status.as_str(),
            "Reservation status changed"
        );
        if after.status == ReservationStatus::Cancelled {
            if let Some(submission) = self.store.find_submission_for_reservation(after.id).await? {
                tracing::warn!(
                    reservation_id = %after.public_id,
                    submission_id = %submission.public_id,
                    state = submission.state.as_str(),
                    "Cancelled reservation keeps its compliance submission unchanged"
                );
            }
        }
        Ok(())
    }

    async fn require_reservation(&self, public_id: Uuid) -> AppResult<Reservation> {
        self.store
            .get_reservation_by_public_id(public_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Reservation not found.".to_string()))
    }

    async fn require_sub_unit(&self, property_id: i64, public_id: Uuid) -> AppResult<SubUnit> {
        let unit = self
            .store
            .get_sub_unit_by_public_id(public_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Sub-unit not found.".to_string()))?;
        if unit.property_id != property_id {
            return Err(AppError::UnprocessableEntity(
                "Sub-unit does not belong to the property.".to_string(),
            ));
        }
        Ok(unit)
    }
}

fn ensure_date_order(check_in: NaiveDate, check_out: NaiveDate) -> AppResult<()> {
    if check_in >= check_out {
        return Err(AppError::UnprocessableEntity(
            "check_in must be before check_out.".to_string(),
        ));
    }
    Ok(())
}

fn checked_transition(
    current: ReservationStatus,
    next: ReservationStatus,
) -> AppResult<ReservationStatus> {
    if current == next || current.can_transition_to(next) {
        return Ok(next);
    }
    Err(AppError::UnprocessableEntity(format!(
        "Status transition from '{current}' to '{next}' is not allowed."
    )))
}

/// The first guest explicitly marked primary wins; otherwise the first guest.
/// Exactly one guest ends up primary.
pub fn assign_primary_guest(inputs: Vec<GuestInput>) -> Vec<NewGuest> {
    let primary_index = inputs
        .iter()
        .position(|guest| guest.is_primary == Some(true))
        .unwrap_or(0);
    inputs
        .into_iter()
        .enumerate()
        .map(|(index, guest)| NewGuest {
            public_id: new_public_id(),
            name: guest.name.trim().to_string(),
            surname: guest.surname.trim().to_string(),
            document_type: guest.document_type,
            document_number: guest.document_number.trim().to_uppercase(),
            birth_date: guest.birth_date,
            nationality: guest.nationality.map(|value| value.trim().to_uppercase()),
            email: guest.email,
            phone: guest.phone,
            is_primary: index == primary_index,
        })
        .collect()
}

fn guest_view(guest: Guest) -> GuestView {
    GuestView {
        id: guest.public_id,
        name: guest.name,
        surname: guest.surname,
        document_type: guest.document_type,
        nationality: guest.nationality,
        is_primary: guest.is_primary,
    }
}

fn submission_view(submission: ComplianceSubmission) -> SubmissionView {
    SubmissionView {
        id: submission.public_id,
        state: submission.state,
        reference: submission.reference,
        attempts: submission.attempts,
        max_attempts: submission.max_attempts,
        rejection_reason: submission.rejection_reason,
        next_retry_at: submission.next_retry_at,
        sent_at: submission.sent_at,
    }
}
