use std::path::PathBuf;
use std::time::Duration;
use std::{env, fmt, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::secrets::{SecretVault, PROVIDER_KEY_ALIAS};

pub const DEFAULT_GEOCODE_ENDPOINT: &str = "https://api.map.baidu.com/geocoding/v3/";
const DEFAULT_RATE_LIMIT_QPS: f64 = 2.0;
const DEFAULT_RATE_LIMIT_BURST: u32 = 1;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 1;
const DEFAULT_RETRY_BASE_MS: u64 = 250;
const DEFAULT_DATABASE_PATH: &str = "geocode.db";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Clone)]
pub struct AppConfig {
    pub geocode_api_key: Option<SecretString>,
    pub geocode_endpoint: String,
    pub rate_limit_qps: f64,
    pub rate_limit_burst: u32,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub database_path: PathBuf,
    pub database_busy_timeout_ms: u64,
    pub backlog_page_size: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocode_endpoint: String,
    pub rate_limit_qps: f64,
    pub rate_limit_burst: u32,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub database_path: String,
    pub database_busy_timeout_ms: u64,
    pub backlog_page_size: usize,
    pub has_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        Self {
            geocode_api_key: vars
                .non_empty("GEOCODE_API_KEY")
                .map(SecretString::from),
            geocode_endpoint: vars
                .non_empty("GEOCODE_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_GEOCODE_ENDPOINT.to_string()),
            rate_limit_qps: vars.positive_rate("GEOCODE_RATE_LIMIT_QPS", DEFAULT_RATE_LIMIT_QPS),
            rate_limit_burst: vars
                .parse("GEOCODE_RATE_LIMIT_BURST", DEFAULT_RATE_LIMIT_BURST)
                .max(1),
            request_timeout_ms: vars.parse("GEOCODE_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
            max_attempts: vars.parse("GEOCODE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            retry_base_ms: vars.parse("GEOCODE_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
            database_path: vars
                .non_empty("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            database_busy_timeout_ms: vars
                .parse("DATABASE_BUSY_TIMEOUT_MS", DEFAULT_BUSY_TIMEOUT_MS),
            backlog_page_size: vars.parse("BACKLOG_PAGE_SIZE", DEFAULT_PAGE_SIZE).max(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn database_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database_busy_timeout_ms)
    }

    /// Credential from the environment first, then the OS keychain.
    pub fn resolve_api_key(&self, vault: &SecretVault) -> AppResult<SecretString> {
        if let Some(key) = &self.geocode_api_key {
            return Ok(key.clone());
        }
        vault.get(PROVIDER_KEY_ALIAS)?.ok_or_else(|| {
            AppError::Config(
                "GEOCODE_API_KEY is not set and no provider key is stored in the keychain".into(),
            )
        })
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocode_endpoint: self.geocode_endpoint.clone(),
            rate_limit_qps: self.rate_limit_qps,
            rate_limit_burst: self.rate_limit_burst,
            request_timeout_ms: self.request_timeout_ms,
            max_attempts: self.max_attempts,
            retry_base_ms: self.retry_base_ms,
            database_path: self.database_path.to_string_lossy().to_string(),
            database_busy_timeout_ms: self.database_busy_timeout_ms,
            backlog_page_size: self.backlog_page_size,
            has_api_key: self.geocode_api_key.is_some(),
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.public_profile(), f)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn non_empty(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        let Some(raw) = (self.0)(key) else {
            return default;
        };
        match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable configuration value");
                default
            }
        }
    }

    /// Calls per second; fractional values are allowed, zero and negatives are not.
    fn positive_rate(&self, key: &str, default: f64) -> f64 {
        let rate = self.parse(key, default);
        if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            warn!(key, rate, "rate must be a positive number; using default");
            default
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
}
