use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::backend::{
    FuelRequest, FuelResponse, LocationPing, OdometerBody, StatusUpdateBody, TripBackend,
};
use crate::config::BackendConfig;
use crate::model::{DriverIdentity, FuelAllocation, Trip, TripId, TripRecord};
use crate::{AppError, AppResult, ErrorKind};

pub const MAX_URL_LENGTH: usize = 2048;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("cannot build request: {reason}")]
    InvalidRequest { reason: String },
}

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedUrl {
    url: Url,
}

impl ValidatedUrl {
    pub fn new(url: impl AsRef<str>) -> Result<Self, HttpError> {
        let raw = url.as_ref();
        if raw.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if raw.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(raw),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(raw.trim()).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(raw),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(raw),
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(raw),
                reason: "URL must have a host".to_string(),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(raw),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(raw),
                reason: "base URL cannot carry a query or fragment".to_string(),
            });
        }

        Ok(Self { url: parsed })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Appends percent-encoded path segments to the base.
    pub fn join_segments<I, S>(&self, segments: I) -> Result<Url, HttpError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = self.url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| HttpError::InvalidRequest {
                    reason: "base URL cannot have path segments".to_string(),
                })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment.as_ref());
            }
        }
        Ok(url)
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            url.to_string()
        } else {
            let cut = (0..=100).rev().find(|i| url.is_char_boundary(*i)).unwrap_or(0);
            format!("{}...", &url[..cut])
        }
    }
}

/// Fleet REST API over `reqwest`.
pub struct RestBackend {
    client: reqwest::Client,
    base: ValidatedUrl,
    token: Option<SecretString>,
}

impl RestBackend {
    pub fn new(config: &BackendConfig) -> AppResult<Self> {
        let base = ValidatedUrl::new(&config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| {
                AppError::new(ErrorKind::Configuration, "cannot build HTTP client")
                    .with_internal(e.to_string())
            })?;

        Ok(Self {
            client,
            base,
            token: config.auth_token.clone().map(SecretString::new),
        })
    }

    fn url<S: AsRef<str>>(&self, segments: &[S]) -> AppResult<Url> {
        Ok(self.base.join_segments(segments)?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> AppResult<Bytes> {
        let response = self.authorize(request).send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = retry_after_ms(response.headers());
        let body = response.bytes().await.map_err(transport_error)?;

        if status.is_success() {
            Ok(body)
        } else {
            debug!(status = status.as_u16(), ?retry_after, "backend rejected request");
            let error = AppError::from_http_status(status.as_u16(), Some(&body));
            Err(match retry_after {
                Some(ms) => error.with_retry_after(ms),
                None => error,
            })
        }
    }
}

/// `Retry-After` in delay-seconds form; HTTP dates are ignored.
fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

fn transport_error(e: reqwest::Error) -> AppError {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_decode() {
        ErrorKind::Deserialization
    } else {
        ErrorKind::Network
    };
    AppError::new(kind, "request to the trip server failed").with_internal(e.to_string())
}

/// Parses a trip listing, skipping records that cannot be understood.
pub(crate) fn parse_trip_listing(body: &[u8]) -> AppResult<Vec<Trip>> {
    let records: Vec<serde_json::Value> = serde_json::from_slice(body)?;
    let mut trips = Vec::with_capacity(records.len());
    for value in records {
        let parsed = serde_json::from_value::<TripRecord>(value)
            .map_err(|e| e.to_string())
            .and_then(|record| Trip::try_from(record).map_err(|e| e.to_string()));
        match parsed {
            Ok(trip) => trips.push(trip),
            Err(reason) => warn!(%reason, "skipping unreadable trip record"),
        }
    }
    Ok(trips)
}

#[async_trait]
impl TripBackend for RestBackend {
    #[instrument(skip(self), fields(org = %identity.org_id, user = %identity.user_id))]
    async fn list_trips(&self, identity: &DriverIdentity) -> AppResult<Vec<Trip>> {
        let url = self.url(&["trips", identity.org_id.as_str(), identity.user_id.as_str()])?;
        let body = self.send(self.client.get(url)).await?;
        parse_trip_listing(&body)
    }

    #[instrument(skip(self, identity, body), fields(trip_id = %trip_id, status = body.t_status))]
    async fn update_trip(
        &self,
        identity: &DriverIdentity,
        trip_id: &TripId,
        body: &StatusUpdateBody,
    ) -> AppResult<()> {
        let url = self.url(&[
            "trips",
            identity.org_id.as_str(),
            identity.user_id.as_str(),
            trip_id.as_str(),
        ])?;
        self.send(self.client.post(url).json(body)).await?;
        Ok(())
    }

    #[instrument(skip(self, identity, body), fields(trip_id = %body.or_trip_id))]
    async fn record_odometer(
        &self,
        identity: &DriverIdentity,
        body: &OdometerBody,
    ) -> AppResult<()> {
        let url = self.url(&[
            "trips",
            "odometer",
            identity.org_id.as_str(),
            identity.user_id.as_str(),
        ])?;
        self.send(self.client.post(url).json(body)).await?;
        Ok(())
    }

    #[instrument(skip(self, _identity, request), fields(trip_id = %request.trip_id))]
    async fn request_fuel(
        &self,
        _identity: &DriverIdentity,
        request: &FuelRequest,
    ) -> AppResult<FuelAllocation> {
        let url = self.url(&["fuel", "create"])?;

        let image = Part::bytes(request.image.data().to_vec())
            .file_name(request.image.file_name())
            .mime_str(request.image.format().mime_type())
            .map_err(|e| {
                AppError::new(ErrorKind::Internal, "cannot attach odometer image")
                    .with_internal(e.to_string())
            })?;
        let form = request
            .text_fields()
            .into_iter()
            .fold(Form::new(), |form, (name, value)| form.text(name, value))
            .part("f_odometer_image", image);

        let body = self.send(self.client.post(url).multipart(form)).await?;
        let response: FuelResponse = serde_json::from_slice(&body)?;
        Ok(FuelAllocation {
            trip_id: request.trip_id.clone(),
            quantity: response.fuel_allocated,
        })
    }

    #[instrument(skip(self, identity, ping), fields(trip_id = %trip_id))]
    async fn ping_location(
        &self,
        identity: &DriverIdentity,
        trip_id: &TripId,
        ping: &LocationPing,
    ) -> AppResult<()> {
        let url = self.url(&[
            "trips",
            "location_phone",
            identity.org_id.as_str(),
            identity.user_id.as_str(),
            trip_id.as_str(),
        ])?;
        self.send(self.client.post(url).json(ping)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TripStatus;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn retry_after_accepts_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_ms(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_ms(&headers), Some(7_000));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after_ms(&headers), None);
    }

    #[test]
    fn test_url_validation_rejects_bad_input() {
        assert!(ValidatedUrl::new("").is_err());
        assert!(ValidatedUrl::new("   ").is_err());
        assert!(matches!(
            ValidatedUrl::new("ftp://example.com"),
            Err(HttpError::InvalidUrl { .. })
        ));
        assert!(ValidatedUrl::new("javascript:alert(1)").is_err());
        assert!(ValidatedUrl::new("https://user:pw@example.com").is_err());
        assert!(ValidatedUrl::new("https://example.com/api?x=1").is_err());
        assert!(ValidatedUrl::new(format!("https://example.com/{}", "a".repeat(3000))).is_err());
    }

    #[test]
    fn test_url_validation_accepts_local_backends() {
        let url = ValidatedUrl::new("http://localhost:8080/api").unwrap();
        assert_eq!(url.host(), "localhost");
    }

    #[test]
    fn test_join_segments_percent_encodes() {
        let base = ValidatedUrl::new("https://fleet.example.com/api/").unwrap();
        let url = base.join_segments(["trips", "org 1", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "https://fleet.example.com/api/trips/org%201/a%2Fb");

        let bare = ValidatedUrl::new("https://fleet.example.com").unwrap();
        let url = bare.join_segments(["fuel", "create"]).unwrap();
        assert_eq!(url.as_str(), "https://fleet.example.com/fuel/create");
    }

    #[test]
    fn test_trip_listing_skips_invalid_records() {
        let body = br#"[
            {"id": 1, "t_status": "Requested", "t_start_lat": "5.6", "t_start_long": "0.1"},
            {"id": 2, "t_status": "Teleported"},
            {"id": 3, "t_status": "In-progress"},
            {"t_status": "Completed"}
        ]"#;
        let trips = parse_trip_listing(body).unwrap();
        assert_eq!(trips.len(), 2);
        assert_eq!(trips[0].status, TripStatus::Requested);
        assert_eq!(trips[1].id, TripId::new("3"));
        assert_eq!(trips[1].status, TripStatus::InProgress);
    }

    #[test]
    fn test_trip_listing_rejects_non_array() {
        let err = parse_trip_listing(br#"{"error": true}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Deserialization);
    }
}
