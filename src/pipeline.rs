use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::provider::{GeocodeProvider, GeocodeResult};
use crate::rate_limit::RateLimiter;
use crate::store::{LocationRecord, PendingRecords, RecordStore, Resolution};
use crate::transform::{self, Coordinate};

const MAX_BACKOFF_EXPONENT: u32 = 6;
const MAX_BACKOFF: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_base_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub pending_at_start: u64,
    pub processed: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub provider_calls: usize,
}

#[derive(Debug, Clone)]
pub struct RunProgress {
    pub record_id: i64,
    pub resolved: bool,
    pub processed: usize,
    pub pending_at_start: u64,
}

pub type ProgressObserver = Arc<dyn Fn(RunProgress) + Send + Sync>;

pub struct GeocodePipeline {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn GeocodeProvider>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    page_size: usize,
    jitter_rng: Mutex<StdRng>,
}

impl GeocodePipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn GeocodeProvider>,
        rate_limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            provider,
            rate_limiter,
            retry,
            page_size: page_size.max(1),
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Resolves every pending record once. Individual record failures are
    /// logged and skipped; only a backlog read failure or cancellation ends
    /// the run with an error.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        observer: Option<ProgressObserver>,
    ) -> AppResult<RunStats> {
        let mut stats = RunStats {
            pending_at_start: self.store.pending_count()?,
            ..RunStats::default()
        };
        info!(
            target: "geocode_pipeline",
            pending = stats.pending_at_start,
            "starting geocode backfill"
        );

        for entry in PendingRecords::new(&*self.store, self.page_size) {
            let record = match entry {
                Ok(record) => record,
                Err(err) => {
                    warn!(target: "geocode_pipeline", error = %err, "backlog scan failed");
                    return Err(err);
                }
            };

            if cancel.is_cancelled() {
                return Err(self.cancelled(&stats));
            }

            let outcome = self.process_record(&record, cancel, &mut stats).await;
            stats.processed += 1;
            let resolved = match outcome {
                Ok(resolution) => {
                    info!(
                        target: "geocode_pipeline",
                        record_id = record.id,
                        lng = %format!("{:.6}", resolution.standard_point.lng),
                        lat = %format!("{:.6}", resolution.standard_point.lat),
                        level = %resolution.level,
                        "record resolved"
                    );
                    stats.resolved += 1;
                    true
                }
                Err(AppError::RateLimitCancelled | AppError::Cancelled) => {
                    stats.skipped += 1;
                    return Err(self.cancelled(&stats));
                }
                Err(err) => {
                    warn!(
                        target: "geocode_pipeline",
                        record_id = record.id,
                        stage = err.stage(),
                        error = %err,
                        "record skipped"
                    );
                    stats.skipped += 1;
                    false
                }
            };

            if let Some(callback) = &observer {
                callback(RunProgress {
                    record_id: record.id,
                    resolved,
                    processed: stats.processed,
                    pending_at_start: stats.pending_at_start,
                });
            }
        }

        info!(target: "geocode_pipeline", stats = ?stats, "geocode backfill finished");
        Ok(stats)
    }

    async fn process_record(
        &self,
        record: &LocationRecord,
        cancel: &CancellationToken,
        stats: &mut RunStats,
    ) -> AppResult<Resolution> {
        let result = self.lookup_with_retry(record, cancel, stats).await?;
        let resolution = resolve(result);

        // Last cancellation point; the write itself is never interrupted.
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.store.update(record.id, &resolution)?;
        Ok(resolution)
    }

    async fn lookup_with_retry(
        &self,
        record: &LocationRecord,
        cancel: &CancellationToken,
        stats: &mut RunStats,
    ) -> AppResult<GeocodeResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.acquire(cancel).await?;
            stats.provider_calls += 1;

            let lookup = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                lookup = self.provider.resolve(&record.address, &record.city) => lookup,
            };

            match lookup {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "geocode_pipeline",
                        record_id = record.id,
                        attempt,
                        error = %err,
                        "geocode lookup failed; retrying after {:?}",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.retry.base_backoff.as_millis() as u64;
        let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
        let base = Duration::from_millis(base_ms.saturating_mul(1 << exponent));
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.jitter_rng.lock().gen_range(0..base_ms))
        };
        base.saturating_add(jitter).min(MAX_BACKOFF)
    }

    fn cancelled(&self, stats: &RunStats) -> AppError {
        warn!(target: "geocode_pipeline", stats = ?stats, "geocode backfill cancelled");
        AppError::Cancelled
    }
}

fn resolve(result: GeocodeResult) -> Resolution {
    let standard_point: Coordinate = transform::convert(result.provider_point);
    Resolution {
        provider_point: result.provider_point,
        standard_point,
        confidence: result.confidence,
        level: result.level,
        comprehension: result.comprehension,
        precise: result.precise,
    }
}
