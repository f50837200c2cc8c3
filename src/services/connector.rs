use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const PENDING_WINDOW_MILLIS: i64 = 2 * 60 * 1000;
const SIMULATED_SEND_FAILURE_RATE: f64 = 0.02;
const SIMULATED_REJECTION_RATE: f64 = 0.05;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("registry transport error: {0}")]
    Transport(String),
    #[error("registry call timed out after {0}s")]
    Timeout(u64),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEstablishment {
    pub name: String,
    pub address: String,
    pub city: String,
    pub province: String,
    pub tourism_license: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestGuest {
    pub name: String,
    pub surname: String,
    pub document_type: String,
    pub document_number: String,
    pub birth_date: Option<NaiveDate>,
    pub nationality: Option<String>,
    pub is_primary: bool,
}

/// Outbound guest manifest ("parte de viajeros").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuestManifest {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub establishment: ManifestEstablishment,
    pub guests: Vec<ManifestGuest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryResponse {
    pub success: bool,
    pub reference: Option<String>,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Accepted,
    Rejected,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryStatus {
    pub reference: String,
    pub state: RemoteState,
    pub code: String,
    pub message: String,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Client for the government lodging registry.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, manifest: &GuestManifest) -> Result<RegistryResponse, ConnectorError>;
    async fn check_status(&self, reference: &str) -> Result<RegistryStatus, ConnectorError>;
    async fn test_connection(&self) -> bool;
}

/// Simulated registry for development.
pub struct StubRegistryConnector {
    simulate_failures: bool,
}

impl StubRegistryConnector {
    pub fn new(simulate_failures: bool) -> Self {
        Self { simulate_failures }
    }
}

fn stub_reference(now: DateTime<Utc>, suffix: u16) -> String {
    format!("SES{}{:03}", now.timestamp_millis(), suffix % 1000)
}

/// Milliseconds timestamp embedded in a stub reference.
fn stub_reference_millis(reference: &str) -> Option<i64> {
    let digits = reference.strip_prefix("SES")?;
    if digits.len() <= 3 || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits[..digits.len() - 3].parse().ok()
}

fn stub_status(
    reference: &str,
    now: DateTime<Utc>,
    reject: bool,
) -> RegistryStatus {
    let Some(sent_millis) = stub_reference_millis(reference) else {
        return RegistryStatus {
            reference: reference.to_string(),
            state: RemoteState::Rejected,
            code: "ERR_NOT_FOUND".to_string(),
            message: "Unknown reference".to_string(),
            processed_at: Some(now),
        };
    };

    let (state, code, message) = if now.timestamp_millis() - sent_millis < PENDING_WINDOW_MILLIS {
        (RemoteState::Pending, "PENDING", "Submission under validation")
    } else if reject {
        (
            RemoteState::Rejected,
            "ERR_REJECTED",
            "Submission rejected: incomplete data",
        )
    } else {
        (RemoteState::Accepted, "OK", "Submission accepted")
    };

    RegistryStatus {
        reference: reference.to_string(),
        state,
        code: code.to_string(),
        message: message.to_string(),
        processed_at: (state != RemoteState::Pending).then_some(now),
    }
}

#[async_trait]
impl RegistryConnector for StubRegistryConnector {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn send(&self, manifest: &GuestManifest) -> Result<RegistryResponse, ConnectorError> {
        tracing::debug!(guests = manifest.guests.len(), "Stub registry send");
        let now = Utc::now();
        let (fail, suffix) = {
            let mut rng = rand::thread_rng();
            (
                self.simulate_failures && rng.gen_bool(SIMULATED_SEND_FAILURE_RATE),
                rng.gen_range(0..1000u16),
            )
        };

        if fail {
            return Ok(RegistryResponse {
                success: false,
                reference: None,
                code: "ERR_VALIDATION".to_string(),
                message: "Validation error: invalid identity document".to_string(),
                timestamp: now,
            });
        }

        Ok(RegistryResponse {
            success: true,
            reference: Some(stub_reference(now, suffix)),
            code: "OK".to_string(),
            message: "Submission received".to_string(),
            timestamp: now,
        })
    }

    async fn check_status(&self, reference: &str) -> Result<RegistryStatus, ConnectorError> {
        let reject =
            self.simulate_failures && rand::thread_rng().gen_bool(SIMULATED_REJECTION_RATE);
        Ok(stub_status(reference, Utc::now(), reject))
    }

    async fn test_connection(&self) -> bool {
        true
    }
}

/// JSON-over-HTTP registry client.
pub struct HttpRegistryConnector {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpRegistryConnector {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: Option<String>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(timeout_seconds.max(1)),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .timeout(self.timeout)
            .header("Accept", "application/json");
        match self.api_key.as_deref() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn map_error(&self, error: reqwest::Error) -> ConnectorError {
        if error.is_timeout() {
            ConnectorError::Timeout(self.timeout.as_secs())
        } else {
            ConnectorError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl RegistryConnector for HttpRegistryConnector {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, manifest: &GuestManifest) -> Result<RegistryResponse, ConnectorError> {
        let response = self
            .request(self.client.post(format!("{}/partes", self.base_url)))
            .json(manifest)
            .send()
            .await
            .map_err(|error| self.map_error(error))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ConnectorError::Unavailable(format!(
                "registry returned {status}"
            )));
        }
        response
            .json::<RegistryResponse>()
            .await
            .map_err(|error| self.map_error(error))
    }

    async fn check_status(&self, reference: &str) -> Result<RegistryStatus, ConnectorError> {
        let response = self
            .request(
                self.client
                    .get(format!("{}/partes/{reference}", self.base_url)),
            )
            .send()
            .await
            .map_err(|error| self.map_error(error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Unavailable(format!(
                "registry returned {status}"
            )));
        }
        response
            .json::<RegistryStatus>()
            .await
            .map_err(|error| self.map_error(error))
    }

    async fn test_connection(&self) -> bool {
        match self
            .request(self.client.get(format!("{}/health", self.base_url)))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::warn!(error = %error, "Registry connection test failed");
                false
            }
        }
    }
}
