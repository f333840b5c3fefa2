//! External calendar service contract.
//!
//! The engine depends on four operations: create, update, delete, and the
//! fingerprint lookup that makes creates idempotent. All four must be safe
//! to call with an already-expired or invalid external id -- that surfaces
//! as a `Permanent` classification, never a crash.

pub mod google;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::event_builder::EventPayload;
use crate::retry::{Classify, ErrorClass};

pub use google::GoogleCalendarService;

/// Calendar service error, classified for the retry executor.
#[derive(Debug, Error)]
pub enum CalendarError {
    /// Non-success HTTP status from the service.
    #[error("calendar API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure (DNS, connect, read).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A write timed out after the request may have been sent; the
    /// server-side outcome is unknown.
    #[error("request timed out with unknown outcome")]
    AmbiguousTimeout,

    /// The service told us to slow down (429 / quota exceeded).
    #[error("rate limited by calendar service")]
    RateLimited { retry_after: Option<Duration> },

    /// The external id does not exist (expired, deleted, or malformed).
    #[error("event not found: {0}")]
    EventNotFound(String),

    /// Missing or rejected credentials.
    #[error("authentication required")]
    AuthenticationRequired,

    /// Malformed payload or response.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for CalendarError {
    fn class(&self) -> ErrorClass {
        match self {
            CalendarError::Api { status, .. } if (500..600).contains(status) => {
                ErrorClass::Transient
            }
            CalendarError::Api { .. } => ErrorClass::Permanent,
            CalendarError::Network(_) => ErrorClass::Transient,
            CalendarError::AmbiguousTimeout => ErrorClass::Ambiguous,
            CalendarError::RateLimited { .. } => ErrorClass::RateLimited,
            CalendarError::EventNotFound(_)
            | CalendarError::AuthenticationRequired
            | CalendarError::Serialization(_) => ErrorClass::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CalendarError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// The external calendar operations the engine depends on.
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Create an event, returning its external id.
    async fn create_event(&self, payload: &EventPayload) -> Result<String, CalendarError>;

    /// Replace an existing event's content.
    async fn update_event(
        &self,
        external_id: &str,
        payload: &EventPayload,
    ) -> Result<(), CalendarError>;

    /// Delete an existing event.
    async fn delete_event(&self, external_id: &str) -> Result<(), CalendarError>;

    /// Find an event carrying the given release fingerprint, if one exists.
    ///
    /// Used before creates, and to resolve ambiguous outcomes: a prior
    /// attempt may have succeeded without the result ever being recorded
    /// locally.
    async fn find_event_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<String>, CalendarError>;
}

/// Supplies a bearer token for the calendar API.
///
/// Token acquisition (OAuth flows, refresh) happens outside the engine;
/// this seam only hands over a currently-valid access token.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Result<String, CalendarError>;
}

/// Token provider backed by a fixed string (CLI and tests).
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Result<String, CalendarError> {
        if self.token.is_empty() {
            return Err(CalendarError::AuthenticationRequired);
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_status() {
        let server_error = CalendarError::Api {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(server_error.class(), ErrorClass::Transient);

        let bad_request = CalendarError::Api {
            status: 400,
            message: "invalid payload".to_string(),
        };
        assert_eq!(bad_request.class(), ErrorClass::Permanent);
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = CalendarError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let bare = CalendarError::RateLimited { retry_after: None };
        assert_eq!(bare.retry_after(), None);
    }

    #[test]
    fn ambiguous_and_permanent_variants() {
        assert_eq!(CalendarError::AmbiguousTimeout.class(), ErrorClass::Ambiguous);
        assert_eq!(
            CalendarError::EventNotFound("evt_gone".to_string()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            CalendarError::AuthenticationRequired.class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn static_token_provider() {
        let provider = StaticTokenProvider::new("ya29.token");
        assert_eq!(provider.access_token().unwrap(), "ya29.token");

        let empty = StaticTokenProvider::new("");
        assert!(matches!(
            empty.access_token(),
            Err(CalendarError::AuthenticationRequired)
        ));
    }
}
