use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    Stub,
    Http,
}

impl RegistryMode {
    fn from_env(value: Option<String>) -> Self {
        match value
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "http" => Self::Http,
            _ => Self::Stub,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stub => "stub",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub dev_auth_overrides_enabled: bool,
    pub jwt_secret: Option<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub db_run_migrations: bool,
    pub default_currency: String,
    pub ical_fetch_timeout_seconds: u64,
    pub worker_enabled: bool,
    pub worker_poll_interval_seconds: u64,
    pub worker_batch_size: i64,
    pub registry_mode: RegistryMode,
    pub registry_api_url: Option<String>,
    pub registry_api_key: Option<String>,
    pub registry_timeout_seconds: u64,
    pub registry_simulate_failures: bool,
    pub compliance_max_attempts: i32,
    pub compliance_backoff_unit_seconds: i64,
    pub compliance_status_check_delay_seconds: i64,
    pub compliance_status_recheck_delay_seconds: i64,
    pub compliance_status_error_cooldown_seconds: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Hospeda API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),
            jwt_secret: env_opt("JWT_SECRET"),
            rate_limit_enabled: env_parse_bool_or("RATE_LIMIT_ENABLED", true),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            db_run_migrations: env_parse_bool_or("DB_RUN_MIGRATIONS", true),
            default_currency: env_or("DEFAULT_CURRENCY", "EUR").to_ascii_uppercase(),
            ical_fetch_timeout_seconds: env_parse_or("ICAL_FETCH_TIMEOUT_SECONDS", 20),
            worker_enabled: env_parse_bool_or("WORKER_ENABLED", true),
            worker_poll_interval_seconds: env_parse_or("WORKER_POLL_INTERVAL_SECONDS", 15),
            worker_batch_size: env_parse_or("WORKER_BATCH_SIZE", 50),
            registry_mode: RegistryMode::from_env(env_opt("REGISTRY_MODE")),
            registry_api_url: env_opt("REGISTRY_API_URL"),
            registry_api_key: env_opt("REGISTRY_API_KEY"),
            registry_timeout_seconds: env_parse_or("REGISTRY_TIMEOUT_SECONDS", 30),
            registry_simulate_failures: env_parse_bool_or("REGISTRY_SIMULATE_FAILURES", false),
            compliance_max_attempts: env_parse_or("COMPLIANCE_MAX_ATTEMPTS", 3),
            compliance_backoff_unit_seconds: env_parse_or("COMPLIANCE_BACKOFF_UNIT_SECONDS", 60),
            compliance_status_check_delay_seconds: env_parse_or(
                "COMPLIANCE_STATUS_CHECK_DELAY_SECONDS",
                300,
            ),
            compliance_status_recheck_delay_seconds: env_parse_or(
                "COMPLIANCE_STATUS_RECHECK_DELAY_SECONDS",
                600,
            ),
            compliance_status_error_cooldown_seconds: env_parse_or(
                "COMPLIANCE_STATUS_ERROR_COOLDOWN_SECONDS",
                1800,
            ),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}
