//! Google Calendar API implementation of [`CalendarService`].
//!
//! Events are all-day entries on the configured calendar. The release
//! fingerprint rides in `extendedProperties.private.releasecal_fingerprint`,
//! which is also what `find_event_by_fingerprint` queries via the
//! `privateExtendedProperty` search parameter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;

use crate::event_builder::EventPayload;

use super::{CalendarError, CalendarService, TokenProvider};

const FINGERPRINT_PROPERTY: &str = "releasecal_fingerprint";
const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Google Calendar v3 client.
pub struct GoogleCalendarService {
    http: Client,
    base_url: String,
    calendar_id: String,
    tokens: Arc<dyn TokenProvider>,
}

impl GoogleCalendarService {
    /// Create a client against the production API.
    ///
    /// `per_call_timeout` bounds every request; a timed-out create surfaces
    /// as an ambiguous outcome, never a hang.
    pub fn new(
        calendar_id: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        per_call_timeout: Duration,
    ) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, calendar_id, tokens, per_call_timeout)
    }

    /// Create a client against a specific base URL (tests).
    pub fn with_base_url(
        base_url: impl Into<String>,
        calendar_id: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        per_call_timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .timeout(per_call_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            calendar_id: calendar_id.into(),
            tokens,
        }
    }

    fn events_url(&self) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        )
    }

    fn event_url(&self, external_id: &str) -> String {
        format!("{}/{}", self.events_url(), urlencoding::encode(external_id))
    }

    /// Map a non-success response to a calendar error.
    async fn error_for(&self, external_id: Option<&str>, response: Response) -> CalendarError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => CalendarError::AuthenticationRequired,
            StatusCode::TOO_MANY_REQUESTS => CalendarError::RateLimited { retry_after },
            // Google reports quota exhaustion as 403 rateLimitExceeded.
            StatusCode::FORBIDDEN if message.contains("ateLimitExceeded") => {
                CalendarError::RateLimited { retry_after }
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                CalendarError::EventNotFound(external_id.unwrap_or("<unknown>").to_string())
            }
            _ => CalendarError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }
}

/// Convert an event payload to the Google Calendar wire format.
pub fn payload_to_json(payload: &EventPayload) -> serde_json::Value {
    let date_str = payload.date.format("%Y-%m-%d").to_string();
    let overrides: Vec<serde_json::Value> = payload
        .reminder_minutes
        .iter()
        .map(|minutes| json!({"method": "popup", "minutes": minutes}))
        .collect();

    json!({
        "summary": payload.summary,
        "description": payload.description,
        "start": {"date": date_str},
        "end": {"date": date_str},
        "colorId": payload.color_id,
        "reminders": {
            "useDefault": false,
            "overrides": overrides,
        },
        "extendedProperties": {
            "private": {
                "releasecal_fingerprint": payload.fingerprint,
            }
        }
    })
}

#[async_trait]
impl CalendarService for GoogleCalendarService {
    async fn create_event(&self, payload: &EventPayload) -> Result<String, CalendarError> {
        let token = self.tokens.access_token()?;
        let response = self
            .http
            .post(self.events_url())
            .bearer_auth(&token)
            .json(&payload_to_json(payload))
            .send()
            .await
            .map_err(|e| {
                // The request may have reached the server before timing out;
                // only the fingerprint lookup can tell.
                if e.is_timeout() {
                    CalendarError::AmbiguousTimeout
                } else {
                    CalendarError::Network(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(self.error_for(None, response).await);
        }

        let body: serde_json::Value = response.json().await?;
        body["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CalendarError::Api {
                status: 200,
                message: "create response missing event id".to_string(),
            })
    }

    async fn update_event(
        &self,
        external_id: &str,
        payload: &EventPayload,
    ) -> Result<(), CalendarError> {
        let token = self.tokens.access_token()?;
        let response = self
            .http
            .put(self.event_url(external_id))
            .bearer_auth(&token)
            .json(&payload_to_json(payload))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(Some(external_id), response).await)
        }
    }

    async fn delete_event(&self, external_id: &str) -> Result<(), CalendarError> {
        let token = self.tokens.access_token()?;
        let response = self
            .http
            .delete(self.event_url(external_id))
            .bearer_auth(&token)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(Some(external_id), response).await)
        }
    }

    async fn find_event_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<String>, CalendarError> {
        let token = self.tokens.access_token()?;
        let url = format!(
            "{}?privateExtendedProperty={}&showDeleted=false&maxResults=2",
            self.events_url(),
            urlencoding::encode(&format!("{FINGERPRINT_PROPERTY}={fingerprint}"))
        );
        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        if !response.status().is_success() {
            return Err(self.error_for(None, response).await);
        }

        let body: serde_json::Value = response.json().await?;
        let found = body["items"]
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .find(|item| item["status"].as_str() != Some("cancelled"))
            })
            .and_then(|item| item["id"].as_str())
            .map(|s| s.to_string());
        Ok(found)
    }
}
