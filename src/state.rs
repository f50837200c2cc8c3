use std::{sync::Arc, time::Duration};

use reqwest::Client;

use crate::{
    config::{AppConfig, RegistryMode},
    db,
    repository::{MemoryStore, PgStore, Store},
    services::{
        calendar::CalendarService,
        compliance::{CompliancePolicy, ComplianceService},
        connector::{HttpRegistryConnector, RegistryConnector, StubRegistryConnector},
        ical::{CalendarFeedSource, HttpFeedSource},
        properties::PropertyService,
        queue::{MemoryTaskQueue, PgTaskQueue, TaskQueue},
        reservations::ReservationService,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub properties: PropertyService,
    pub calendar: CalendarService,
    pub reservations: ReservationService,
    pub compliance: ComplianceService,
}

impl AppState {
    pub async fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let db_pool = db::create_pool(&config)?;
        let (store, queue): (Arc<dyn Store>, Arc<dyn TaskQueue>) = match db_pool.as_ref() {
            Some(pool) => {
                if config.db_run_migrations {
                    db::run_migrations(pool).await?;
                }
                (
                    Arc::new(PgStore::new(pool.clone())),
                    Arc::new(PgTaskQueue::new(pool.clone())),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL is not set, using the in-memory store");
                (Arc::new(MemoryStore::new()), Arc::new(MemoryTaskQueue::new()))
            }
        };

        let connector = build_connector(&config, &http_client)?;
        let feeds: Arc<dyn CalendarFeedSource> = Arc::new(HttpFeedSource::new(
            http_client.clone(),
            config.ical_fetch_timeout_seconds,
        ));

        Ok(Self::from_parts(
            config,
            store,
            queue,
            connector,
            feeds,
        ))
    }

    /// Wires services over already-built backends.
    pub fn from_parts(
        config: AppConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        connector: Arc<dyn RegistryConnector>,
        feeds: Arc<dyn CalendarFeedSource>,
    ) -> Self {
        let compliance = ComplianceService::new(
            store.clone(),
            queue.clone(),
            connector,
            CompliancePolicy::from_config(&config),
        );
        let calendar = CalendarService::new(store.clone());
        let reservations = ReservationService::new(
            store.clone(),
            calendar.clone(),
            compliance.clone(),
            feeds,
            &config.default_currency,
        );

        Self {
            properties: PropertyService::new(store.clone()),
            calendar,
            reservations,
            compliance,
            config: Arc::new(config),
            store,
            queue,
        }
    }
}

fn build_connector(
    config: &AppConfig,
    http_client: &Client,
) -> Result<Arc<dyn RegistryConnector>, Box<dyn std::error::Error>> {
    match config.registry_mode {
        RegistryMode::Stub => Ok(Arc::new(StubRegistryConnector::new(
            config.registry_simulate_failures,
        ))),
        RegistryMode::Http => {
            let base_url = config
                .registry_api_url
                .as_deref()
                .ok_or("REGISTRY_API_URL is required when REGISTRY_MODE=http")?;
            Ok(Arc::new(HttpRegistryConnector::new(
                http_client.clone(),
                base_url,
                config.registry_api_key.clone(),
                config.registry_timeout_seconds,
            )))
        }
    }
}
