use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("rate limiter wait cancelled before a slot was granted")]
    RateLimitCancelled,
    #[error("geocoding request failed: {0}")]
    Network(String),
    #[error("geocoding response did not match the expected schema: {0}")]
    MalformedResponse(String),
    #[error("geocoding provider rejected the request (status {status}): {body}")]
    ProviderRejection { status: i64, body: String },
    #[error(transparent)]
    Persistence(#[from] rusqlite::Error),
    #[error("record {0} is missing or already resolved")]
    NotPending(i64),
    #[error("run cancelled")]
    Cancelled,
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
}

impl AppError {
    /// Only transport-level failures are worth another attempt; a rejection
    /// or a schema mismatch will come back the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Network(_))
    }

    pub fn stage(&self) -> &'static str {
        match self {
            AppError::RateLimitCancelled => "rate_limit",
            AppError::Network(_)
            | AppError::MalformedResponse(_)
            | AppError::ProviderRejection { .. } => "fetch",
            AppError::Persistence(_) | AppError::NotPending(_) => "persist",
            AppError::Cancelled => "cancelled",
            AppError::Config(_) | AppError::Io(_) | AppError::Keychain(_) => "setup",
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        // The request URL carries the access key in its query string.
        let err = err.without_url();
        if err.is_timeout() {
            AppError::Network(format!("request timed out: {err}"))
        } else {
            AppError::Network(err.to_string())
        }
    }
}
