//! Fixtures shared by service and route tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use axum::{body::to_bytes, response::Response, Router};
use chrono::{Days, NaiveDate, Utc};
use serde_json::{json, Value};
use url::Url;

use crate::{
    config::{AppConfig, RegistryMode},
    error::AppResult,
    models::{
        new_public_id, Channel, DocumentType, LifecycleEventKind, NewGuest, NewProperty,
        NewReservation, OperationalStatus, Property, Reservation, ReservationStatus,
    },
    repository::{MemoryStore, Store},
    routes::v1_router,
    services::{
        audit::lifecycle_event,
        connector::{
            ConnectorError, GuestManifest, RegistryConnector, RegistryResponse, RegistryStatus,
            RemoteState,
        },
        ical::CalendarFeedSource,
        queue::MemoryTaskQueue,
    },
    state::AppState,
};

/// Feed source that always returns the same document.
pub struct StaticFeedSource(pub String);

#[async_trait]
impl CalendarFeedSource for StaticFeedSource {
    async fn fetch(&self, _url: &Url) -> AppResult<String> {
        Ok(self.0.clone())
    }
}

/// In-memory app with dev identity overrides, for router tests.
pub fn test_app() -> (Router, AppState) {
    test_app_with_feed("")
}

pub fn test_app_with_feed(feed: &str) -> (Router, AppState) {
    let mut config = AppConfig::from_env();
    config.environment = "test".to_string();
    config.dev_auth_overrides_enabled = true;
    config.database_url = None;
    config.registry_mode = RegistryMode::Stub;
    config.default_currency = "EUR".to_string();

    let state = AppState::from_parts(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryTaskQueue::new()),
        Arc::new(ScriptedConnector::default()),
        Arc::new(StaticFeedSource(feed.to_string())),
    );
    (v1_router().with_state(state.clone()), state)
}

pub async fn read_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

static NEXT_LICENSE: AtomicI64 = AtomicI64::new(1);
static NEXT_SLOT: AtomicI64 = AtomicI64::new(0);

pub async fn seed_property(store: &dyn Store) -> Property {
    let license = NEXT_LICENSE.fetch_add(1, Ordering::Relaxed);
    store
        .insert_property(NewProperty {
            public_id: new_public_id(),
            name: "Casa del Olivo".to_string(),
            address: "Calle Sierpes 12".to_string(),
            city: "Sevilla".to_string(),
            province: "Sevilla".to_string(),
            tourism_license: format!("VFT/SE/{license:05}"),
            capacity: 6,
        })
        .await
        .expect("seed property")
}

pub fn sample_guest(is_primary: bool) -> NewGuest {
    NewGuest {
        public_id: new_public_id(),
        name: "Lucia".to_string(),
        surname: "Garcia".to_string(),
        document_type: DocumentType::Dni,
        document_number: "12345678Z".to_string(),
        birth_date: NaiveDate::from_ymd_opt(1990, 4, 2),
        nationality: Some("ES".to_string()),
        email: Some("lucia@example.com".to_string()),
        phone: Some("+34600000000".to_string()),
        is_primary,
    }
}

/// Inserts a reservation on its own non-overlapping slot with `guests` guests.
pub async fn seed_reservation_with_guest(
    store: &dyn Store,
    property_id: i64,
    external_id: Option<&str>,
    guests: usize,
) -> Reservation {
    let slot = NEXT_SLOT.fetch_add(1, Ordering::Relaxed) as u64;
    let base = NaiveDate::from_ymd_opt(2030, 1, 1).expect("date");
    let check_in = base + Days::new(slot * 10);
    store
        .insert_reservation(
            NewReservation {
                public_id: new_public_id(),
                external_id: external_id.map(ToOwned::to_owned),
                property_id,
                sub_unit_id: None,
                check_in,
                check_out: check_in + Days::new(3),
                guest_count: guests.max(1) as i32,
                total_price: 300.0,
                currency: "EUR".to_string(),
                channel: Channel::Direct,
                status: ReservationStatus::Confirmed,
                operational_status: if guests > 0 {
                    OperationalStatus::DataComplete
                } else {
                    OperationalStatus::Created
                },
                notes: None,
            },
            (0..guests).map(|index| sample_guest(index == 0)).collect(),
            lifecycle_event(LifecycleEventKind::ReservationCreated, json!({})),
        )
        .await
        .expect("seed reservation")
}

/// Registry double driven by queued outcomes.
#[derive(Default)]
pub struct ScriptedConnector {
    failing_sends: AtomicUsize,
    sends: AtomicUsize,
    statuses: Mutex<VecDeque<Result<RemoteState, ()>>>,
}

impl ScriptedConnector {
    /// The next `count` sends fail with a transport error.
    pub fn fail_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn push_status(&self, status: Result<RemoteState, ()>) {
        self.statuses
            .lock()
            .expect("status script")
            .push_back(status);
    }

    pub fn send_calls(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryConnector for ScriptedConnector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, _manifest: &GuestManifest) -> Result<RegistryResponse, ConnectorError> {
        let call = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(ConnectorError::Transport("connection reset".to_string()));
        }
        Ok(RegistryResponse {
            success: true,
            reference: Some(format!("REF{call:04}")),
            code: "OK".to_string(),
            message: "received".to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn check_status(&self, reference: &str) -> Result<RegistryStatus, ConnectorError> {
        let next = self
            .statuses
            .lock()
            .expect("status script")
            .pop_front()
            .unwrap_or(Ok(RemoteState::Accepted));
        let state = next.map_err(|_| ConnectorError::Unavailable("registry down".to_string()))?;
        Ok(RegistryStatus {
            reference: reference.to_string(),
            state,
            code: match state {
                RemoteState::Accepted => "OK",
                RemoteState::Rejected => "ERR_REJECTED",
                RemoteState::Pending => "PENDING",
            }
            .to_string(),
            message: "scripted".to_string(),
            processed_at: (state != RemoteState::Pending).then(Utc::now),
        })
    }

    async fn test_connection(&self) -> bool {
        true
    }
}
