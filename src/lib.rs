mod config;
mod db;
mod errors;
mod pipeline;
mod provider;
mod rate_limit;
mod secrets;
mod store;
mod transform;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{AppConfig, PublicAppConfig, DEFAULT_GEOCODE_ENDPOINT};
pub use db::{bootstrap, DatabaseContext};
pub use errors::{AppError, AppResult};
pub use pipeline::{GeocodePipeline, ProgressObserver, RetryPolicy, RunProgress, RunStats};
pub use provider::{GeocodeProvider, GeocodeResult, HttpGeocodeClient};
pub use rate_limit::RateLimiter;
pub use secrets::{SecretVault, PROVIDER_KEY_ALIAS, VAULT_SERVICE_NAME};
pub use store::{
    LocationRecord, PendingRecords, RecordStore, Resolution, SqliteRecordStore, StoredLocation,
};
pub use transform::{bd09_to_gcj02, convert, gcj02_to_wgs84, Coordinate};

/// Wires the components together from configuration and runs one pass over
/// the backlog.
pub async fn run_backfill(config: &AppConfig, cancel: &CancellationToken) -> AppResult<RunStats> {
    let vault = SecretVault::new(VAULT_SERVICE_NAME);
    let api_key = config.resolve_api_key(&vault)?;
    info!(config = ?config.public_profile(), "configuration loaded");

    let DatabaseContext { connection, .. } =
        bootstrap(&config.database_path, config.database_busy_timeout())?;
    let store = Arc::new(SqliteRecordStore::new(Arc::new(Mutex::new(connection))));
    let provider = Arc::new(HttpGeocodeClient::from_config(config, api_key)?);
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_qps,
        config.rate_limit_burst,
    ));

    let pipeline = GeocodePipeline::new(
        store,
        provider,
        rate_limiter,
        RetryPolicy::from_config(config),
        config.backlog_page_size,
    );
    pipeline.run(cancel, None).await
}

/// Explicit `target:` names used by the components; events without one fall
/// under the crate's module path.
const LOG_TARGETS: &[&str] = &[
    "geocode_pipeline",
    "geocode_provider",
    "record_store",
    "rate_limiter",
    "database_bootstrap",
    "secret_vault",
];

fn default_log_filter() -> String {
    let mut directives = vec!["info".to_string(), "geocode_backfill=debug".to_string()];
    directives.extend(LOG_TARGETS.iter().map(|target| format!("{target}=debug")));
    directives.join(",")
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
