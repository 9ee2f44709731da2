//! REST directory: talks to a hosted database-as-a-service over
//! PostgREST-style endpoints.
//!
//! Tables are read with `GET /rest/v1/<table>?col=op.value`, the
//! bookability join lives server-side behind `POST /rest/v1/rpc/bookable_providers`,
//! and bookings are inserted into `appointments`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::BookingDirectory;
use crate::booking::model::{BookingId, BookingRequest, Payer, Provider, ProviderFilter, Slot};
use crate::error::DirectoryError;

const BACKEND: &str = "rest";

/// Connection settings for the hosted directory.
#[derive(Debug, Clone)]
pub struct RestDirectoryConfig {
    /// Project URL without a trailing slash, e.g. `https://abc.example.co`.
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout: Duration,
}

/// `BookingDirectory` backed by a PostgREST-style HTTP API.
pub struct RestDirectory {
    config: RestDirectoryConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CreatedRow {
    id: String,
}

impl RestDirectory {
    pub fn new(config: RestDirectoryConfig) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DirectoryError::RequestFailed {
                backend: BACKEND.into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        info!(base_url = %config.base_url, "REST directory configured");
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{path}", self.config.base_url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let key = self.config.api_key.expose_secret();
        builder
            .header("apikey", key)
            .bearer_auth(key)
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, DirectoryError> {
        self.authorized(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                DirectoryError::Timeout {
                    backend: BACKEND.into(),
                    timeout: self.config.timeout,
                }
            } else {
                DirectoryError::RequestFailed {
                    backend: BACKEND.into(),
                    reason: e.to_string(),
                }
            }
        })
    }

    /// Map non-success statuses to typed errors, then decode the JSON body.
    async fn decode<T: DeserializeOwned>(
        &self,
        resp: Response,
        entity: &str,
        id: &str,
    ) -> Result<T, DirectoryError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), entity, "Directory request rejected");
            return Err(match status {
                StatusCode::CONFLICT => DirectoryError::Conflict(if body.is_empty() {
                    format!("{entity} {id} is no longer available")
                } else {
                    body
                }),
                StatusCode::NOT_FOUND => DirectoryError::NotFound {
                    entity: entity.to_string(),
                    id: id.to_string(),
                },
                _ => DirectoryError::BadStatus {
                    backend: BACKEND.into(),
                    status: status.as_u16(),
                    body,
                },
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| DirectoryError::InvalidResponse {
                backend: BACKEND.into(),
                reason: format!("{entity}: {e}"),
            })
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl BookingDirectory for RestDirectory {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn list_payers(&self) -> Result<Vec<Payer>, DirectoryError> {
        let req = self
            .client
            .get(self.url("payers"))
            .query(&[("active", "eq.true"), ("order", "name.asc")]);
        let resp = self.send(req).await?;
        let payers: Vec<Payer> = self.decode(resp, "payers", "*").await?;
        debug!(count = payers.len(), "Fetched payers");
        Ok(payers)
    }

    async fn list_providers(
        &self,
        filter: &ProviderFilter,
    ) -> Result<Vec<Provider>, DirectoryError> {
        let body = serde_json::json!({
            "p_payer_id": filter.payer_id,
            "p_specialty": filter.specialty,
            "p_available_after": filter.available_after.as_ref().map(timestamp),
        });
        let req = self.client.post(self.url("rpc/bookable_providers")).json(&body);
        let resp = self.send(req).await?;
        let providers: Vec<Provider> = self.decode(resp, "payer", &filter.payer_id).await?;
        debug!(payer_id = %filter.payer_id, count = providers.len(), "Fetched bookable providers");
        Ok(providers)
    }

    async fn list_slots(
        &self,
        provider_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<Slot>, DirectoryError> {
        let provider_eq = format!("eq.{provider_id}");
        let starts_gt = format!("gt.{}", timestamp(&from));
        let req = self.client.get(self.url("slots")).query(&[
            ("select", "id,provider_id,starts_at,ends_at"),
            ("provider_id", provider_eq.as_str()),
            ("status", "eq.open"),
            ("starts_at", starts_gt.as_str()),
            ("order", "starts_at.asc"),
        ]);
        let resp = self.send(req).await?;
        self.decode(resp, "provider", provider_id).await
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingId, DirectoryError> {
        let body = serde_json::json!({
            "slot_id": request.slot.id,
            "provider_id": request.provider_id,
            "payer_id": request.payer_id,
            "member_id": request.member_id,
            "booked_for_self": request.booked_for_self,
            "patient": request.patient,
            "contact": request.contact,
            "reason": request.reason,
        });
        let req = self
            .client
            .post(self.url("appointments"))
            .header("Prefer", "return=representation")
            .json(&body);
        let resp = self.send(req).await?;
        let rows: Vec<CreatedRow> = self.decode(resp, "slot", &request.slot.id).await?;

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| DirectoryError::InvalidResponse {
                backend: BACKEND.into(),
                reason: "appointments insert returned no rows".into(),
            })?;
        info!(booking_id = %row.id, slot_id = %request.slot.id, "Booking created");
        Ok(BookingId(row.id))
    }
}
