use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::transform::Coordinate;

/// A successful geocode, still in the provider's BD-09 datum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeResult {
    pub provider_point: Coordinate,
    pub precise: i64,
    pub confidence: i64,
    pub comprehension: i64,
    pub level: String,
    pub status: i64,
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    async fn resolve(&self, address: &str, city: &str) -> AppResult<GeocodeResult>;
}

pub struct HttpGeocodeClient {
    http: Client,
    endpoint: Url,
    api_key: SecretString,
}

impl HttpGeocodeClient {
    pub fn new(endpoint: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid geocode endpoint {endpoint}: {err}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn from_config(config: &AppConfig, api_key: SecretString) -> AppResult<Self> {
        Self::new(&config.geocode_endpoint, api_key, config.request_timeout())
    }
}

#[derive(Deserialize)]
struct Envelope {
    status: i64,
    result: Option<ResponseResult>,
}

#[derive(Deserialize)]
struct ResponseResult {
    location: ResponseLocation,
    precise: i64,
    confidence: i64,
    comprehension: i64,
    level: String,
}

#[derive(Deserialize)]
struct ResponseLocation {
    lng: f64,
    lat: f64,
}

#[async_trait]
impl GeocodeProvider for HttpGeocodeClient {
    async fn resolve(&self, address: &str, city: &str) -> AppResult<GeocodeResult> {
        trace!(target: "geocode_provider", address, city, "issuing geocode request");
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("address", address),
                ("city", city),
                ("output", "json"),
                ("ak", self.api_key.expose_secret()),
            ])
            .send()
            .await?;

        let http_status = response.status();
        let body = response.text().await?;
        if !http_status.is_success() {
            return Err(AppError::Network(format!(
                "provider answered HTTP {http_status}: {body}"
            )));
        }

        let parsed = parse_response(&body)?;
        debug!(
            target: "geocode_provider",
            level = %parsed.level,
            confidence = parsed.confidence,
            "geocode resolved"
        );
        Ok(parsed)
    }
}

fn parse_response(body: &str) -> AppResult<GeocodeResult> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|err| AppError::MalformedResponse(format!("{err}; body: {body}")))?;

    if envelope.status != 0 {
        return Err(AppError::ProviderRejection {
            status: envelope.status,
            body: body.to_string(),
        });
    }

    let result = envelope.result.ok_or_else(|| {
        AppError::MalformedResponse(format!("status 0 without a result; body: {body}"))
    })?;

    Ok(GeocodeResult {
        provider_point: Coordinate::new(result.location.lng, result.location.lat),
        precise: result.precise,
        confidence: result.confidence,
        comprehension: result.comprehension,
        level: result.level,
        status: envelope.status,
    })
}
