use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppError,
    models::{Channel, DocumentType, ReservationStatus},
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

fn default_limit_50() -> i64 {
    50
}

fn default_limit_100() -> i64 {
    100
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePropertyInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 500))]
    pub address: String,
    #[validate(length(min = 1, max = 120))]
    pub city: String,
    #[validate(length(min = 1, max = 120))]
    pub province: String,
    #[validate(length(min = 1, max = 64))]
    pub tourism_license: String,
    #[validate(range(min = 1, max = 500))]
    pub capacity: i32,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateSubUnitInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(range(min = 1, max = 100))]
    pub capacity: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertiesQuery {
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct GuestInput {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(length(min = 1, max = 200))]
    pub surname: String,
    pub document_type: DocumentType,
    #[validate(length(min = 1, max = 40))]
    pub document_number: String,
    pub birth_date: Option<NaiveDate>,
    #[validate(length(min = 2, max = 3))]
    pub nationality: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 40))]
    pub phone: Option<String>,
    pub is_primary: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateReservationInput {
    #[validate(length(min = 1, max = 255))]
    pub external_id: Option<String>,
    pub property_id: Uuid,
    pub sub_unit_id: Option<Uuid>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    #[validate(range(min = 1, max = 20))]
    pub guest_count: i32,
    #[validate(range(min = 0.0))]
    pub total_price: f64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub channel: Option<Channel>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub guests: Vec<GuestInput>,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize, Validate)]
pub struct UpdateReservationInput {
    pub check_in: Option<NaiveDate>,
    pub check_out: Option<NaiveDate>,
    #[validate(range(min = 1, max = 20))]
    pub guest_count: Option<i32>,
    #[validate(range(min = 0.0))]
    pub total_price: Option<f64>,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    pub status: Option<ReservationStatus>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReservationStatusInput {
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReservationsQuery {
    pub property_id: Option<Uuid>,
    #[serde(rename = "from")]
    pub check_in_from: Option<NaiveDate>,
    #[serde(rename = "to")]
    pub check_in_to: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
    pub channel: Option<Channel>,
    #[serde(default = "default_limit_50")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct ImportCalendarInput {
    #[validate(length(min = 1, max = 2000))]
    pub feed_url: String,
    pub property_id: Uuid,
    pub channel: Option<Channel>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CalendarQuery {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AvailabilityQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct EvidenceQuery {
    pub property_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertyPath {
    pub property_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReservationPath {
    pub reservation_id: Uuid,
}
