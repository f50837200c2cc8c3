use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
    models::{
        AttemptOutcome, ComplianceSubmission, LifecycleEventKind, NewAttempt, NewSubmission,
        OperationalStatus, Property, Reservation, SubmissionFilter, SubmissionState,
        new_public_id,
    },
    repository::Store,
    services::{
        audit::write_lifecycle_event,
        connector::{
            ConnectorError, GuestManifest, ManifestEstablishment, ManifestGuest,
            RegistryConnector, RegistryResponse, RemoteState,
        },
        hashing::sha256_hex,
        queue::{ComplianceJob, TaskQueue},
    },
};

/// Slack for queue and application clocks disagreeing on a retry time.
const RETRY_CLOCK_TOLERANCE_SECONDS: i64 = 5;

/// Retry and polling cadence of the submission pipeline.
#[derive(Debug, Clone, Copy)]
pub struct CompliancePolicy {
    pub max_attempts: i32,
    pub backoff_unit: Duration,
    pub status_check_delay: Duration,
    pub status_recheck_delay: Duration,
    pub status_error_cooldown: Duration,
    pub connector_timeout: std::time::Duration,
}

impl CompliancePolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.compliance_max_attempts.max(1),
            backoff_unit: Duration::seconds(config.compliance_backoff_unit_seconds.max(1)),
            status_check_delay: Duration::seconds(config.compliance_status_check_delay_seconds),
            status_recheck_delay: Duration::seconds(
                config.compliance_status_recheck_delay_seconds,
            ),
            status_error_cooldown: Duration::seconds(
                config.compliance_status_error_cooldown_seconds,
            ),
            connector_timeout: std::time::Duration::from_secs(
                config.registry_timeout_seconds.max(1),
            ),
        }
    }

    /// `2^attempts` backoff units.
    pub fn retry_delay(&self, attempts: i32) -> Duration {
        let exponent = attempts.clamp(0, 16) as u32;
        self.backoff_unit * 2_i32.pow(exponent)
    }
}

impl Default for CompliancePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::seconds(60),
            status_check_delay: Duration::minutes(5),
            status_recheck_delay: Duration::minutes(10),
            status_error_cooldown: Duration::minutes(30),
            connector_timeout: std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The submission was no longer pending.
    Skipped,
    /// Delivered before `next_retry_at`; the scheduled retry job still owns it.
    Deferred { retry_at: DateTime<Utc> },
    Sent { reference: String },
    RetryScheduled { attempts: i32, retry_at: DateTime<Utc> },
    Exhausted { attempts: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Skipped,
    StillPending { recheck_at: DateTime<Utc> },
    Resolved(SubmissionState),
    CheckFailed { retry_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceAttempt {
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub response_code: Option<String>,
    pub request_hash: String,
    pub response_hash: Option<String>,
}

/// Inspector-facing submission summary. Carries no guest data.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRecord {
    pub submission_id: Uuid,
    pub reservation_id: Uuid,
    pub property_id: Uuid,
    pub property_name: String,
    pub tourism_license: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub state: SubmissionState,
    pub reference: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub rejection_reason: Option<String>,
    pub history: Vec<EvidenceAttempt>,
}

#[derive(Debug, Serialize)]
struct EvidenceCsvRow<'a> {
    submission_id: String,
    property_name: &'a str,
    tourism_license: &'a str,
    state: &'static str,
    reference: &'a str,
    attempts: i32,
    rejection_reason: &'a str,
    created_at: String,
    sent_at: String,
    attempted_at: String,
    attempt_outcome: &'static str,
    response_code: &'a str,
    request_hash: &'a str,
    response_hash: &'a str,
}

#[derive(Clone)]
pub struct ComplianceService {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    connector: Arc<dyn RegistryConnector>,
    policy: CompliancePolicy,
}

struct SendFailure {
    reason: String,
    response_code: Option<String>,
    response_message: Option<String>,
    response_hash: Option<String>,
}

impl ComplianceService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        connector: Arc<dyn RegistryConnector>,
        policy: CompliancePolicy,
    ) -> Self {
        Self {
            store,
            queue,
            connector,
            policy,
        }
    }

    pub async fn create_submission(
        &self,
        reservation_id: i64,
        external_id: Option<&str>,
    ) -> AppResult<ComplianceSubmission> {
        if let Some(external_id) = external_id.map(str::trim).filter(|id| !id.is_empty()) {
            if let Some(twin) = self.store.find_reservation_by_external_id(external_id).await? {
                if let Some(existing) = self.store.find_submission_for_reservation(twin.id).await? {
                    tracing::debug!(
                        submission_id = %existing.public_id,
                        "Submission already exists for external id"
                    );
                    return Ok(existing);
                }
            }
        }
        if let Some(existing) = self
            .store
            .find_submission_for_reservation(reservation_id)
            .await?
        {
            return Ok(existing);
        }

        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Reservation not found.".to_string()))?;
        let guests = self.store.list_guests(reservation.id).await?;
        if guests.is_empty() {
            return Err(AppError::UnprocessableEntity(
                "Reservation has no guests to report.".to_string(),
            ));
        }

        let submission = self
            .store
            .insert_submission(NewSubmission {
                public_id: new_public_id(),
                reservation_id: reservation.id,
                max_attempts: self.policy.max_attempts,
                next_retry_at: Utc::now(),
            })
            .await?;
        self.queue
            .enqueue(
                ComplianceJob::SendSubmission {
                    submission_id: submission.id,
                },
                Duration::zero(),
            )
            .await?;
        write_lifecycle_event(
            self.store.as_ref(),
            reservation.id,
            LifecycleEventKind::SubmissionScheduled,
            json!({ "submission_id": submission.public_id }),
        )
        .await;

        tracing::info!(
            submission_id = %submission.public_id,
            reservation_id = %reservation.public_id,
            "Compliance submission scheduled"
        );
        Ok(submission)
    }

    /// Handler for `SendSubmission`; safe under duplicate and early delivery.
    pub async fn send(&self, submission_id: i64) -> AppResult<SendOutcome> {
        let mut submission = self.require_submission(submission_id).await?;
        if submission.state == SubmissionState::Sent && submission.next_retry_at.is_some() {
            // A previous delivery committed the send but never queued its status check.
            return self.schedule_status_check(submission).await;
        }
        if submission.state != SubmissionState::Pending {
            tracing::debug!(
                submission_id = %submission.public_id,
                state = submission.state.as_str(),
                terminal = submission.state.is_terminal(),
                "Submission already processed"
            );
            return Ok(SendOutcome::Skipped);
        }
        if let Some(retry_at) = submission.next_retry_at {
            if retry_at - Duration::seconds(RETRY_CLOCK_TOLERANCE_SECONDS) > Utc::now() {
                tracing::debug!(
                    submission_id = %submission.public_id,
                    retry_at = %retry_at,
                    "Submission delivered before its retry time"
                );
                return Ok(SendOutcome::Deferred { retry_at });
            }
        }

        let reservation = self.require_reservation(submission.reservation_id).await?;
        if !submission.attempts_remaining() {
            submission.state = SubmissionState::Error;
            submission.next_retry_at = None;
            self.store.update_submission(&submission).await?;
            return Ok(SendOutcome::Exhausted {
                attempts: submission.attempts,
            });
        }

        let manifest = self.build_manifest(&reservation).await?;
        let request_hash = sha256_hex(&manifest)?;

        let result = match tokio::time::timeout(
            self.policy.connector_timeout,
            self.connector.send(&manifest),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(
                self.policy.connector_timeout.as_secs(),
            )),
        };

        match result {
            Ok(response) if response.success && response.reference.is_some() => {
                self.record_success(submission, &reservation, response, request_hash)
                    .await
            }
            Ok(response) => {
                let failure = SendFailure {
                    reason: format!("Registry rejected submission: {}", response.message),
                    response_code: Some(response.code.clone()),
                    response_message: Some(response.message.clone()),
                    response_hash: Some(sha256_hex(&response)?),
                };
                self.record_failure(submission, &reservation, failure, request_hash)
                    .await
            }
            Err(error) => {
                let failure = SendFailure {
                    reason: error.to_string(),
                    response_code: None,
                    response_message: None,
                    response_hash: None,
                };
                self.record_failure(submission, &reservation, failure, request_hash)
                    .await
            }
        }
    }

    /// Commits the send before queueing the status check. `next_retry_at`
    /// stays set on a sent submission until the check is queued, so a
    /// redelivered job can finish the hand-off without a second send.
    async fn record_success(
        &self,
        mut submission: ComplianceSubmission,
        reservation: &Reservation,
        response: RegistryResponse,
        request_hash: String,
    ) -> AppResult<SendOutcome> {
        let reference = response.reference.clone().unwrap_or_default();
        let response_hash = sha256_hex(&response)?;

        self.store
            .insert_attempt(NewAttempt {
                submission_id: submission.id,
                outcome: AttemptOutcome::Sent,
                response_code: Some(response.code),
                response_message: Some(response.message),
                request_hash,
                response_hash: Some(response_hash),
            })
            .await?;

        submission.state = SubmissionState::Sent;
        submission.attempts += 1;
        submission.reference = Some(reference.clone());
        submission.sent_at = Some(Utc::now());
        submission.next_retry_at = Some(Utc::now() + self.policy.status_check_delay);
        submission.rejection_reason = None;
        self.store.update_submission(&submission).await?;

        if reservation.operational_status != OperationalStatus::ComplianceSubmitted {
            if let Err(error) = self
                .store
                .set_operational_status(reservation.id, OperationalStatus::ComplianceSubmitted)
                .await
            {
                tracing::warn!(
                    reservation_id = %reservation.public_id,
                    error = %error,
                    "Could not advance operational status"
                );
            }
        }

        write_lifecycle_event(
            self.store.as_ref(),
            reservation.id,
            LifecycleEventKind::SubmissionSucceeded,
            json!({
                "submission_id": submission.public_id,
                "reference": reference,
            }),
        )
        .await;

        tracing::info!(
            submission_id = %submission.public_id,
            reference = %reference,
            "Compliance submission sent"
        );
        self.schedule_status_check(submission).await
    }

    async fn schedule_status_check(
        &self,
        mut submission: ComplianceSubmission,
    ) -> AppResult<SendOutcome> {
        let reference = submission.reference.clone().ok_or_else(|| {
            AppError::Internal("Sent submission has no registry reference.".to_string())
        })?;
        let delay = submission
            .next_retry_at
            .map(|due| (due - Utc::now()).max(Duration::zero()))
            .unwrap_or(self.policy.status_check_delay);
        self.reschedule_check(&submission, &reference, delay).await?;

        submission.next_retry_at = None;
        self.store.update_submission(&submission).await?;
        Ok(SendOutcome::Sent { reference })
    }

    async fn record_failure(
        &self,
        mut submission: ComplianceSubmission,
        reservation: &Reservation,
        failure: SendFailure,
        request_hash: String,
    ) -> AppResult<SendOutcome> {
        submission.attempts += 1;
        let will_retry = submission.attempts_remaining();
        let retry_at = Utc::now() + self.policy.retry_delay(submission.attempts);

        submission.rejection_reason = Some(failure.reason.clone());
        if will_retry {
            submission.state = SubmissionState::Pending;
            submission.next_retry_at = Some(retry_at);
        } else {
            submission.state = SubmissionState::Error;
            submission.next_retry_at = None;
        }
        self.store.update_submission(&submission).await?;

        self.store
            .insert_attempt(NewAttempt {
                submission_id: submission.id,
                outcome: AttemptOutcome::Failed,
                response_code: failure.response_code,
                response_message: failure.response_message,
                request_hash,
                response_hash: failure.response_hash,
            })
            .await?;

        write_lifecycle_event(
            self.store.as_ref(),
            reservation.id,
            LifecycleEventKind::SubmissionFailed,
            json!({
                "submission_id": submission.public_id,
                "error": failure.reason,
                "attempts": submission.attempts,
                "will_retry": will_retry,
            }),
        )
        .await;

        if will_retry {
            self.queue
                .enqueue(
                    ComplianceJob::SendSubmission {
                        submission_id: submission.id,
                    },
                    self.policy.retry_delay(submission.attempts),
                )
                .await?;
            tracing::warn!(
                submission_id = %submission.public_id,
                attempts = submission.attempts,
                retry_at = %retry_at,
                "Compliance submission failed, retry scheduled"
            );
            Ok(SendOutcome::RetryScheduled {
                attempts: submission.attempts,
                retry_at,
            })
        } else {
            tracing::error!(
                submission_id = %submission.public_id,
                attempts = submission.attempts,
                "Compliance submission exhausted its attempts"
            );
            Ok(SendOutcome::Exhausted {
                attempts: submission.attempts,
            })
        }
    }

    /// Handler for `CheckStatus`. Poll errors reschedule the poll and never
    /// consume the send attempt budget.
    pub async fn check_status(
        &self,
        submission_id: i64,
        reference: &str,
    ) -> AppResult<StatusOutcome> {
        let mut submission = self.require_submission(submission_id).await?;
        if submission.state != SubmissionState::Sent {
            return Ok(StatusOutcome::Skipped);
        }

        let polled = match tokio::time::timeout(
            self.policy.connector_timeout,
            self.connector.check_status(reference),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(
                self.policy.connector_timeout.as_secs(),
            )),
        };

        let status = match polled {
            Ok(status) => status,
            Err(error) => {
                let retry_at = Utc::now() + self.policy.status_error_cooldown;
                self.reschedule_check(&submission, reference, self.policy.status_error_cooldown)
                    .await?;
                tracing::warn!(
                    submission_id = %submission.public_id,
                    error = %error,
                    "Registry status check failed, retry scheduled"
                );
                return Ok(StatusOutcome::CheckFailed { retry_at });
            }
        };

        let (state, outcome, kind) = match status.state {
            RemoteState::Pending => {
                let recheck_at = Utc::now() + self.policy.status_recheck_delay;
                self.reschedule_check(&submission, reference, self.policy.status_recheck_delay)
                    .await?;
                return Ok(StatusOutcome::StillPending { recheck_at });
            }
            RemoteState::Accepted => (
                SubmissionState::Accepted,
                AttemptOutcome::Accepted,
                LifecycleEventKind::SubmissionSucceeded,
            ),
            RemoteState::Rejected => (
                SubmissionState::Rejected,
                AttemptOutcome::Rejected,
                LifecycleEventKind::SubmissionFailed,
            ),
        };

        submission.state = state;
        submission.rejection_reason =
            (state == SubmissionState::Rejected).then(|| status.message.clone());
        self.store.update_submission(&submission).await?;

        if let Some(mut attempt) = self.store.latest_attempt(submission.id).await? {
            attempt.outcome = outcome;
            attempt.response_code = Some(status.code.clone());
            attempt.response_message = Some(status.message.clone());
            attempt.response_hash = Some(sha256_hex(&status)?);
            self.store.update_attempt(&attempt).await?;
        }

        write_lifecycle_event(
            self.store.as_ref(),
            submission.reservation_id,
            kind,
            json!({
                "submission_id": submission.public_id,
                "reference": reference,
                "final_state": state.as_str(),
            }),
        )
        .await;

        tracing::info!(
            submission_id = %submission.public_id,
            state = state.as_str(),
            "Compliance submission resolved"
        );
        Ok(StatusOutcome::Resolved(state))
    }

    pub async fn evidence_export(&self, filter: &SubmissionFilter) -> AppResult<Vec<EvidenceRecord>> {
        let submissions = self.store.list_submissions(filter).await?;
        let mut properties: HashMap<i64, Property> = HashMap::new();
        let mut records = Vec::with_capacity(submissions.len());

        for submission in submissions {
            let reservation = self.require_reservation(submission.reservation_id).await?;
            if !properties.contains_key(&reservation.property_id) {
                let property = self
                    .store
                    .get_property(reservation.property_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound("Property not found.".to_string()))?;
                properties.insert(property.id, property);
            }
            let Some(property) = properties.get(&reservation.property_id) else {
                continue;
            };
            let history = self
                .store
                .list_attempts(submission.id)
                .await?
                .into_iter()
                .map(|attempt| EvidenceAttempt {
                    attempted_at: attempt.attempted_at,
                    outcome: attempt.outcome,
                    response_code: attempt.response_code,
                    request_hash: attempt.request_hash,
                    response_hash: attempt.response_hash,
                })
                .collect();

            records.push(EvidenceRecord {
                submission_id: submission.public_id,
                reservation_id: reservation.public_id,
                property_id: property.public_id,
                property_name: property.name.clone(),
                tourism_license: property.tourism_license.clone(),
                created_at: submission.created_at,
                sent_at: submission.sent_at,
                state: submission.state,
                reference: submission.reference,
                attempts: submission.attempts,
                max_attempts: submission.max_attempts,
                rejection_reason: submission.rejection_reason,
                history,
            });
        }
        Ok(records)
    }

    pub async fn test_connection(&self) -> bool {
        match tokio::time::timeout(self.policy.connector_timeout, self.connector.test_connection())
            .await
        {
            Ok(ok) => ok,
            Err(_) => false,
        }
    }

    pub fn connector_name(&self) -> &'static str {
        self.connector.name()
    }

    async fn reschedule_check(
        &self,
        submission: &ComplianceSubmission,
        reference: &str,
        delay: Duration,
    ) -> AppResult<()> {
        self.queue
            .enqueue(
                ComplianceJob::CheckStatus {
                    submission_id: submission.id,
                    reference: reference.to_string(),
                },
                delay,
            )
            .await
            .map(|_| ())
    }

    async fn build_manifest(&self, reservation: &Reservation) -> AppResult<GuestManifest> {
        let property = self
            .store
            .get_property(reservation.property_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Property not found.".to_string()))?;
        let guests = self.store.list_guests(reservation.id).await?;
        Ok(GuestManifest {
            check_in: reservation.check_in,
            check_out: reservation.check_out,
            establishment: ManifestEstablishment {
                name: property.name,
                address: property.address,
                city: property.city,
                province: property.province,
                tourism_license: property.tourism_license,
            },
            guests: guests
                .into_iter()
                .map(|guest| ManifestGuest {
                    name: guest.name,
                    surname: guest.surname,
                    document_type: guest.document_type.as_str().to_string(),
                    document_number: guest.document_number,
                    birth_date: guest.birth_date,
                    nationality: guest.nationality,
                    is_primary: guest.is_primary,
                })
                .collect(),
        })
    }

    async fn require_submission(&self, submission_id: i64) -> AppResult<ComplianceSubmission> {
        self.store
            .get_submission(submission_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Compliance submission not found.".to_string()))
    }

    async fn require_reservation(&self, reservation_id: i64) -> AppResult<Reservation> {
        self.store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Reservation not found.".to_string()))
    }
}

/// One CSV row per attempt; submissions without attempts get a single row.
pub fn evidence_csv(records: &[EvidenceRecord]) -> AppResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_error = |error: csv::Error| AppError::Internal(format!("CSV export failed: {error}"));

    for record in records {
        if record.history.is_empty() {
            writer.serialize(csv_row(record, None)).map_err(csv_error)?;
        }
        for attempt in &record.history {
            writer
                .serialize(csv_row(record, Some(attempt)))
                .map_err(csv_error)?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|error| AppError::Internal(format!("CSV export failed: {error}")))?;
    String::from_utf8(bytes)
        .map_err(|error| AppError::Internal(format!("CSV export failed: {error}")))
}

fn csv_row<'a>(
    record: &'a EvidenceRecord,
    attempt: Option<&'a EvidenceAttempt>,
) -> EvidenceCsvRow<'a> {
    EvidenceCsvRow {
        submission_id: record.submission_id.to_string(),
        property_name: &record.property_name,
        tourism_license: &record.tourism_license,
        state: record.state.as_str(),
        reference: record.reference.as_deref().unwrap_or_default(),
        attempts: record.attempts,
        rejection_reason: record.rejection_reason.as_deref().unwrap_or_default(),
        created_at: record.created_at.to_rfc3339(),
        sent_at: record
            .sent_at
            .map(|value| value.to_rfc3339())
            .unwrap_or_default(),
        attempted_at: attempt
            .map(|value| value.attempted_at.to_rfc3339())
            .unwrap_or_default(),
        attempt_outcome: attempt.map(|value| value.outcome.as_str()).unwrap_or(""),
        response_code: attempt
            .and_then(|value| value.response_code.as_deref())
            .unwrap_or_default(),
        request_hash: attempt
            .map(|value| value.request_hash.as_str())
            .unwrap_or_default(),
        response_hash: attempt
            .and_then(|value| value.response_hash.as_deref())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use super::{evidence_csv, ComplianceService, CompliancePolicy, SendOutcome, StatusOutcome};
    use crate::{
        error::{AppError, AppResult},
        models::{
            LifecycleEventKind, OperationalStatus, ReservationStatus, SubmissionFilter,
            SubmissionState,
        },
        repository::{MemoryStore, Store},
        services::{
            connector::{
                ConnectorError, GuestManifest, RegistryConnector, RegistryResponse,
                RegistryStatus, RemoteState,
            },
            queue::{ComplianceJob, JobDisposition, MemoryTaskQueue, QueuedJob, TaskQueue},
            testing::{seed_property, seed_reservation_with_guest, ScriptedConnector},
        },
    };

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryTaskQueue>,
        connector: Arc<ScriptedConnector>,
        service: ComplianceService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let connector = Arc::new(ScriptedConnector::default());
        let service = ComplianceService::new(
            store.clone(),
            queue.clone(),
            connector.clone(),
            CompliancePolicy::default(),
        );
        Harness {
            store,
            queue,
            connector,
            service,
        }
    }

    /// Pulls the submission's retry time into the past.
    async fn make_due(store: &MemoryStore, submission_id: i64) {
        let mut submission = store
            .get_submission(submission_id)
            .await
            .expect("load")
            .expect("submission");
        submission.next_retry_at = Some(Utc::now() - Duration::seconds(1));
        store.update_submission(&submission).await.expect("rewind");
    }

    /// Registry double that cancels the booking while the send is in flight.
    struct CancellingConnector {
        store: Arc<MemoryStore>,
        reservation_id: i64,
    }

    #[async_trait]
    impl RegistryConnector for CancellingConnector {
        fn name(&self) -> &'static str {
            "cancelling"
        }

        async fn send(&self, _manifest: &GuestManifest) -> Result<RegistryResponse, ConnectorError> {
            let mut reservation = self
                .store
                .get_reservation(self.reservation_id)
                .await
                .expect("load")
                .expect("reservation");
            reservation.status = ReservationStatus::Cancelled;
            self.store
                .update_reservation(&reservation)
                .await
                .expect("cancel");
            Ok(RegistryResponse {
                success: true,
                reference: Some("REF0001".to_string()),
                code: "OK".to_string(),
                message: "received".to_string(),
                timestamp: Utc::now(),
            })
        }

        async fn check_status(&self, _reference: &str) -> Result<RegistryStatus, ConnectorError> {
            Err(ConnectorError::Unavailable("not scripted".to_string()))
        }

        async fn test_connection(&self) -> bool {
            true
        }
    }

    /// Memory queue whose first status-check enqueue fails.
    #[derive(Default)]
    struct FlakyQueue {
        inner: MemoryTaskQueue,
        check_enqueue_failed: AtomicBool,
    }

    #[async_trait]
    impl TaskQueue for FlakyQueue {
        async fn enqueue(&self, job: ComplianceJob, delay: Duration) -> AppResult<i64> {
            if matches!(job, ComplianceJob::CheckStatus { .. })
                && !self.check_enqueue_failed.swap(true, Ordering::SeqCst)
            {
                return Err(AppError::Internal("queue unavailable".to_string()));
            }
            self.inner.enqueue(job, delay).await
        }

        async fn claim_due(&self, batch_size: i64) -> AppResult<Vec<QueuedJob>> {
            self.inner.claim_due(batch_size).await
        }

        async fn complete(&self, job: &QueuedJob) -> AppResult<()> {
            self.inner.complete(job).await
        }

        async fn fail(&self, job: &QueuedJob, error: &str) -> AppResult<JobDisposition> {
            self.inner.fail(job, error).await
        }
    }

    #[tokio::test]
    async fn create_submission_requires_guests_and_is_idempotent() {
        let h = harness();
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, Some("ext_001"), 1).await;

        let first = h
            .service
            .create_submission(reservation.id, Some("ext_001"))
            .await
            .expect("submission");
        assert_eq!(first.state, SubmissionState::Pending);
        assert_eq!(first.attempts, 0);
        assert_eq!(first.max_attempts, 3);

        let again = h
            .service
            .create_submission(reservation.id, Some("ext_001"))
            .await
            .expect("replay");
        assert_eq!(again.id, first.id);
        assert_eq!(h.queue.queued().await.len(), 1);

        let events = h.store.list_events(reservation.id).await.expect("events");
        assert!(events
            .iter()
            .any(|event| event.kind == LifecycleEventKind::SubmissionScheduled));

        let bare = seed_reservation_with_guest(h.store.as_ref(), property.id, None, 0).await;
        let error = h
            .service
            .create_submission(bare.id, None)
            .await
            .expect_err("no guests");
        assert_eq!(error.status_code().as_u16(), 422);
    }

    #[tokio::test]
    async fn successful_send_records_evidence_and_schedules_status_check() {
        let h = harness();
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, None, 1).await;
        let submission = h
            .service
            .create_submission(reservation.id, None)
            .await
            .expect("submission");

        let outcome = h.service.send(submission.id).await.expect("send");
        let SendOutcome::Sent { reference } = outcome else {
            panic!("expected a sent outcome");
        };

        let stored = h
            .store
            .get_submission(submission.id)
            .await
            .expect("load")
            .expect("submission");
        assert_eq!(stored.state, SubmissionState::Sent);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.reference.as_deref(), Some(reference.as_str()));
        assert!(stored.next_retry_at.is_none());

        let attempts = h.store.list_attempts(submission.id).await.expect("attempts");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].request_hash.len(), 64);
        assert!(attempts[0].response_hash.is_some());

        let reloaded = h
            .store
            .get_reservation(reservation.id)
            .await
            .expect("load")
            .expect("reservation");
        assert_eq!(
            reloaded.operational_status,
            OperationalStatus::ComplianceSubmitted
        );

        let queued = h.queue.queued().await;
        let check = queued
            .iter()
            .find(|job| matches!(job.job, ComplianceJob::CheckStatus { .. }))
            .expect("status check queued");
        let delay = check.run_at - Utc::now();
        assert!(delay > Duration::minutes(4) && delay <= Duration::minutes(5));
    }

    #[tokio::test]
    async fn duplicate_send_delivery_is_a_no_op() {
        let h = harness();
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, None, 2).await;
        let submission = h
            .service
            .create_submission(reservation.id, None)
            .await
            .expect("submission");

        h.service.send(submission.id).await.expect("send");
        let second = h.service.send(submission.id).await.expect("resend");
        assert_eq!(second, SendOutcome::Skipped);
        assert_eq!(h.connector.send_calls(), 1);
        assert_eq!(
            h.store.list_attempts(submission.id).await.expect("attempts").len(),
            1
        );
    }

    #[tokio::test]
    async fn repeated_failures_stop_exactly_at_max_attempts() {
        let h = harness();
        h.connector.fail_sends(10);
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, None, 1).await;
        let submission = h
            .service
            .create_submission(reservation.id, None)
            .await
            .expect("submission");

        let first = h.service.send(submission.id).await.expect("attempt 1");
        let SendOutcome::RetryScheduled { attempts, retry_at } = first else {
            panic!("expected retry");
        };
        assert_eq!(attempts, 1);
        let wait = retry_at - Utc::now();
        assert!(wait > Duration::seconds(110) && wait <= Duration::seconds(120));

        let early = h.service.send(submission.id).await.expect("early delivery");
        assert_eq!(early, SendOutcome::Deferred { retry_at });
        assert_eq!(h.connector.send_calls(), 1);

        make_due(h.store.as_ref(), submission.id).await;
        let second = h.service.send(submission.id).await.expect("attempt 2");
        let SendOutcome::RetryScheduled { attempts, retry_at } = second else {
            panic!("expected retry");
        };
        assert_eq!(attempts, 2);
        let wait = retry_at - Utc::now();
        assert!(wait > Duration::seconds(230) && wait <= Duration::seconds(240));

        make_due(h.store.as_ref(), submission.id).await;
        let third = h.service.send(submission.id).await.expect("attempt 3");
        assert_eq!(third, SendOutcome::Exhausted { attempts: 3 });

        let stored = h
            .store
            .get_submission(submission.id)
            .await
            .expect("load")
            .expect("submission");
        assert_eq!(stored.state, SubmissionState::Error);
        assert_eq!(stored.attempts, 3);
        assert!(stored.rejection_reason.is_some());
        assert!(stored.next_retry_at.is_none());

        assert_eq!(h.service.send(submission.id).await.expect("noop"), SendOutcome::Skipped);
        assert_eq!(h.connector.send_calls(), 3);

        let retries = h
            .queue
            .queued()
            .await
            .into_iter()
            .filter(|job| matches!(job.job, ComplianceJob::SendSubmission { .. }))
            .count();
        // The initial immediate job plus one delayed retry per non-final failure.
        assert_eq!(retries, 3);

        let failures = h
            .store
            .list_events(reservation.id)
            .await
            .expect("events")
            .into_iter()
            .filter(|event| event.kind == LifecycleEventKind::SubmissionFailed)
            .collect::<Vec<_>>();
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[2].metadata["will_retry"], serde_json::json!(false));
        assert_eq!(
            h.store.list_attempts(submission.id).await.expect("attempts").len(),
            3
        );
    }

    #[tokio::test]
    async fn send_keeps_edits_made_while_the_registry_call_was_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let property = seed_property(store.as_ref()).await;
        let reservation = seed_reservation_with_guest(store.as_ref(), property.id, None, 1).await;
        let service = ComplianceService::new(
            store.clone(),
            queue.clone(),
            Arc::new(CancellingConnector {
                store: store.clone(),
                reservation_id: reservation.id,
            }),
            CompliancePolicy::default(),
        );
        let submission = service
            .create_submission(reservation.id, None)
            .await
            .expect("submission");

        let outcome = service.send(submission.id).await.expect("send");
        assert!(matches!(outcome, SendOutcome::Sent { .. }));

        let reloaded = store
            .get_reservation(reservation.id)
            .await
            .expect("load")
            .expect("reservation");
        assert_eq!(reloaded.status, ReservationStatus::Cancelled);
        assert_eq!(
            reloaded.operational_status,
            OperationalStatus::ComplianceSubmitted
        );
    }

    #[tokio::test]
    async fn redelivery_restores_a_status_check_that_failed_to_enqueue() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(FlakyQueue::default());
        let connector = Arc::new(ScriptedConnector::default());
        let service = ComplianceService::new(
            store.clone(),
            queue.clone(),
            connector.clone(),
            CompliancePolicy::default(),
        );
        let property = seed_property(store.as_ref()).await;
        let reservation = seed_reservation_with_guest(store.as_ref(), property.id, None, 1).await;
        let submission = service
            .create_submission(reservation.id, None)
            .await
            .expect("submission");

        assert!(service.send(submission.id).await.is_err());
        let stored = store
            .get_submission(submission.id)
            .await
            .expect("load")
            .expect("submission");
        assert_eq!(stored.state, SubmissionState::Sent);

        let redelivered = service.send(submission.id).await.expect("redelivery");
        assert!(matches!(redelivered, SendOutcome::Sent { .. }));
        assert_eq!(connector.send_calls(), 1);

        let checks = queue
            .inner
            .queued()
            .await
            .into_iter()
            .filter(|job| matches!(job.job, ComplianceJob::CheckStatus { .. }))
            .collect::<Vec<_>>();
        assert_eq!(checks.len(), 1);
        let delay = checks[0].run_at - Utc::now();
        assert!(delay > Duration::minutes(4) && delay <= Duration::minutes(5));

        let stored = store
            .get_submission(submission.id)
            .await
            .expect("load")
            .expect("submission");
        assert!(stored.next_retry_at.is_none());
        assert_eq!(
            service.send(submission.id).await.expect("duplicate"),
            SendOutcome::Skipped
        );
        assert_eq!(store.list_attempts(submission.id).await.expect("attempts").len(), 1);
    }

    #[tokio::test]
    async fn status_check_resolves_or_reschedules() {
        let h = harness();
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, None, 1).await;
        let submission = h
            .service
            .create_submission(reservation.id, None)
            .await
            .expect("submission");
        let SendOutcome::Sent { reference } = h.service.send(submission.id).await.expect("send")
        else {
            panic!("expected a sent outcome");
        };

        h.connector.push_status(Ok(RemoteState::Pending));
        let pending = h
            .service
            .check_status(submission.id, &reference)
            .await
            .expect("poll");
        assert!(matches!(pending, StatusOutcome::StillPending { .. }));

        h.connector.push_status(Err(()));
        let failed = h
            .service
            .check_status(submission.id, &reference)
            .await
            .expect("poll");
        let StatusOutcome::CheckFailed { retry_at } = failed else {
            panic!("expected check failure");
        };
        assert!(retry_at - Utc::now() > Duration::minutes(29));
        let stored = h
            .store
            .get_submission(submission.id)
            .await
            .expect("load")
            .expect("submission");
        assert_eq!(stored.attempts, 1);

        h.connector.push_status(Ok(RemoteState::Accepted));
        let resolved = h
            .service
            .check_status(submission.id, &reference)
            .await
            .expect("poll");
        assert_eq!(resolved, StatusOutcome::Resolved(SubmissionState::Accepted));

        let attempt = h
            .store
            .latest_attempt(submission.id)
            .await
            .expect("attempt")
            .expect("attempt");
        assert_eq!(attempt.outcome.as_str(), "accepted");

        let again = h
            .service
            .check_status(submission.id, &reference)
            .await
            .expect("poll");
        assert_eq!(again, StatusOutcome::Skipped);
    }

    #[tokio::test]
    async fn evidence_export_is_free_of_guest_data() {
        let h = harness();
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, None, 1).await;
        let submission = h
            .service
            .create_submission(reservation.id, None)
            .await
            .expect("submission");
        h.service.send(submission.id).await.expect("send");

        let records = h
            .service
            .evidence_export(&SubmissionFilter {
                property_id: Some(property.id),
                ..SubmissionFilter::default()
            })
            .await
            .expect("export");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tourism_license, property.tourism_license);
        assert_eq!(records[0].history.len(), 1);

        let json = serde_json::to_string(&records).expect("json");
        let csv = evidence_csv(&records).expect("csv");
        for needle in ["Lucia", "Garcia", "12345678Z", "lucia@example.com"] {
            assert!(!json.contains(needle), "json leaked {needle}");
            assert!(!csv.contains(needle), "csv leaked {needle}");
        }
        assert!(csv.starts_with("submission_id,"));
        assert_eq!(csv.lines().count(), 2);

        let events = h.store.list_events(reservation.id).await.expect("events");
        let metadata = serde_json::to_string(
            &events.iter().map(|event| &event.metadata).collect::<Vec<_>>(),
        )
        .expect("json");
        assert!(!metadata.contains("12345678Z"));
    }
}
