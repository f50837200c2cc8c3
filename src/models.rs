use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Declares a snake_case text enum with `as_str`/`parse` helpers so the
/// same spelling is used on the wire and in storage.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Commercial lifecycle of a booking.
    ReservationStatus {
        Created => "created",
        Confirmed => "confirmed",
        Cancelled => "cancelled",
    }
);

text_enum!(
    /// Progress of a booking through the guest-registration workflow.
    OperationalStatus {
        Created => "created",
        DataComplete => "data_complete",
        ComplianceSubmitted => "compliance_submitted",
    }
);

text_enum!(
    Channel {
        Direct => "direct",
        Airbnb => "airbnb",
        Booking => "booking",
        Vrbo => "vrbo",
        IcalImport => "ical_import",
    }
);

text_enum!(
    DocumentType {
        Dni => "dni",
        Nie => "nie",
        Passport => "passport",
    }
);

text_enum!(
    /// `pending -> sent -> accepted | rejected`, `pending -> error` once the
    /// attempt budget is spent.
    SubmissionState {
        Pending => "pending",
        Sent => "sent",
        Accepted => "accepted",
        Rejected => "rejected",
        Error => "error",
    }
);

text_enum!(
    AttemptOutcome {
        Sent => "sent",
        Failed => "failed",
        Accepted => "accepted",
        Rejected => "rejected",
    }
);

text_enum!(
    LifecycleEventKind {
        ReservationCreated => "reservation_created",
        SubmissionScheduled => "submission_scheduled",
        SubmissionSucceeded => "submission_succeeded",
        SubmissionFailed => "submission_failed",
    }
);

impl ReservationStatus {
    pub fn is_active(self) -> bool {
        self != Self::Cancelled
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Created => matches!(next, Self::Confirmed | Self::Cancelled),
            Self::Confirmed => next == Self::Cancelled,
            Self::Cancelled => false,
        }
    }
}

impl SubmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Error)
    }
}

impl LifecycleEventKind {
    pub fn description(self) -> &'static str {
        match self {
            Self::ReservationCreated => "Reservation created",
            Self::SubmissionScheduled => "Guest registry submission scheduled",
            Self::SubmissionSucceeded => "Guest registry submission processed",
            Self::SubmissionFailed => "Guest registry submission failed",
        }
    }
}

/// Time-sortable public identifier.
pub fn new_public_id() -> Uuid {
    Uuid::now_v7()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    #[serde(skip)]
    pub id: i64,
    pub public_id: Uuid,
    pub name: String,
    pub address: String,
    pub city: String,
    pub province: String,
    pub tourism_license: String,
    pub capacity: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProperty {
    pub public_id: Uuid,
    pub name: String,
    pub address: String,
    pub city: String,
    pub province: String,
    pub tourism_license: String,
    pub capacity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubUnit {
    #[serde(skip)]
    pub id: i64,
    pub public_id: Uuid,
    #[serde(skip)]
    pub property_id: i64,
    pub name: String,
    pub capacity: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubUnit {
    pub public_id: Uuid,
    pub property_id: i64,
    pub name: String,
    pub capacity: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: i64,
    pub public_id: Uuid,
    pub external_id: Option<String>,
    pub property_id: i64,
    pub sub_unit_id: Option<i64>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guest_count: i32,
    pub total_price: f64,
    pub currency: String,
    pub channel: Channel,
    pub status: ReservationStatus,
    pub operational_status: OperationalStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days().max(0)
    }

    pub fn average_nightly_price(&self) -> f64 {
        let nights = self.nights();
        if nights == 0 {
            return 0.0;
        }
        self.total_price / nights as f64
    }

    /// Half-open `[check_in, check_out)` test for a single calendar day.
    pub fn covers_day(&self, day: NaiveDate) -> bool {
        day >= self.check_in && day < self.check_out
    }
}

#[derive(Debug, Clone)]
pub struct NewReservation {
    pub public_id: Uuid,
    pub external_id: Option<String>,
    pub property_id: i64,
    pub sub_unit_id: Option<i64>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guest_count: i32,
    pub total_price: f64,
    pub currency: String,
    pub channel: Channel,
    pub status: ReservationStatus,
    pub operational_status: OperationalStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Guest {
    pub id: i64,
    pub public_id: Uuid,
    pub reservation_id: i64,
    pub name: String,
    pub surname: String,
    pub document_type: DocumentType,
    pub document_number: String,
    pub birth_date: Option<NaiveDate>,
    pub nationality: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGuest {
    pub public_id: Uuid,
    pub name: String,
    pub surname: String,
    pub document_type: DocumentType,
    pub document_number: String,
    pub birth_date: Option<NaiveDate>,
    pub nationality: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceSubmission {
    pub id: i64,
    pub public_id: Uuid,
    pub reservation_id: i64,
    pub state: SubmissionState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub reference: Option<String>,
    pub rejection_reason: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComplianceSubmission {
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub public_id: Uuid,
    pub reservation_id: i64,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
}

/// Evidence of one network exchange with the registry. Hashes only.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionAttempt {
    pub id: i64,
    pub submission_id: i64,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
    pub request_hash: String,
    pub response_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub submission_id: i64,
    pub outcome: AttemptOutcome,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
    pub request_hash: String,
    pub response_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub id: i64,
    pub public_id: Uuid,
    pub reservation_id: i64,
    pub kind: LifecycleEventKind,
    pub description: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Event payload; metadata must already be redacted (see `services::audit`).
#[derive(Debug, Clone)]
pub struct NewLifecycleEvent {
    pub public_id: Uuid,
    pub kind: LifecycleEventKind,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionQuery {
    pub property_id: i64,
    pub sub_unit_id: Option<i64>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub exclude_reservation_id: Option<i64>,
}

impl CollisionQuery {
    /// `candidate.start < existing.end AND candidate.end > existing.start`
    /// against active reservations in an overlapping scope. A whole-property
    /// stay shares scope with every unit of the property.
    pub fn collides_with(&self, existing: &Reservation) -> bool {
        if !existing.status.is_active() || existing.property_id != self.property_id {
            return false;
        }
        if self.exclude_reservation_id == Some(existing.id) {
            return false;
        }
        if let (Some(unit), Some(other)) = (self.sub_unit_id, existing.sub_unit_id) {
            if unit != other {
                return false;
            }
        }
        self.check_in < existing.check_out && self.check_out > existing.check_in
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReservationFilter {
    pub property_id: Option<i64>,
    pub check_in_from: Option<NaiveDate>,
    pub check_in_to: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
    pub channel: Option<Channel>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionFilter {
    pub property_id: Option<i64>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}
