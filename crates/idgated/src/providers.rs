//! Seams to the remote liveness service and the object store, plus the
//! JSON gateway client used in production.

use std::time::Duration;

use async_trait::async_trait;
use idgate_core::liveness::{ProviderImage, SessionSettings};
use idgate_core::{ObjectLocation, SessionResults, SessionStatus};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProviderError {
    /// Worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProviderError::Status { status, .. } => is_transient_status(*status),
            ProviderError::Malformed(_) | ProviderError::Storage(_) => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    StatusCode::from_u16(status)
        .map(|s| {
            s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS || s == StatusCode::REQUEST_TIMEOUT
        })
        .unwrap_or(false)
}

/// What the provider answered to a create call. A missing id is a failed
/// creation, decided by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: Option<String>,
}

#[async_trait]
pub trait LivenessProvider: Send + Sync {
    async fn create_session(&self, settings: &SessionSettings) -> Result<CreatedSession, ProviderError>;

    async fn get_session_results(&self, session_id: &str) -> Result<SessionResults, ProviderError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ProviderError>;

    /// Remove the object. Removing something that is not there is not an error.
    async fn delete(&self, location: &ObjectLocation) -> Result<(), ProviderError>;

    /// A URL that stops working after `ttl`.
    async fn retrieval_url(&self, location: &ObjectLocation, ttl: Duration) -> Result<String, ProviderError>;

    /// A permanent URL, for buckets served without signing.
    fn public_url(&self, location: &ObjectLocation) -> String;
}

// ── HTTP gateway ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    settings: &'a SessionSettings,
}

/// Session results as the gateway sends them. Status is free text so that
/// provider-specific values like `CREATED` survive until mapped.
#[derive(Debug, Deserialize)]
struct WireResults {
    status: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reference_image: Option<ProviderImage>,
    #[serde(default)]
    audit_images: Vec<ProviderImage>,
}

impl From<WireResults> for SessionResults {
    fn from(w: WireResults) -> Self {
        let status = SessionStatus::from_provider(&w.status);
        if status == SessionStatus::Unknown {
            tracing::warn!(status = %w.status, "unrecognised session status");
        }
        SessionResults {
            status,
            confidence: w.confidence,
            reference_image: w.reference_image,
            audit_images: w.audit_images,
        }
    }
}

/// Liveness provider reached through a JSON gateway:
/// `POST {base}/sessions` and `GET {base}/sessions/{id}/results`.
pub struct HttpLivenessProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpLivenessProvider {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl LivenessProvider for HttpLivenessProvider {
    async fn create_session(&self, settings: &SessionSettings) -> Result<CreatedSession, ProviderError> {
        let url = format!("{}/sessions", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .json(&CreateSessionBody { settings })
            .send()
            .await?;
        let created: CreatedSession = Self::check(response).await?.json().await?;
        tracing::debug!(session_id = ?created.session_id, "gateway create_session answered");
        Ok(created)
    }

    async fn get_session_results(&self, session_id: &str) -> Result<SessionResults, ProviderError> {
        if session_id.is_empty() || session_id.contains('/') {
            return Err(ProviderError::Malformed(format!("bad session id '{session_id}'")));
        }
        let url = format!("{}/sessions/{session_id}/results", self.base_url);
        let response = self.authorize(self.client.get(&url)).send().await?;
        let wire: WireResults = Self::check(response).await?.json().await?;
        Ok(wire.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_results_map_created_to_in_progress() {
        let wire: WireResults = serde_json::from_str(r#"{"status":"CREATED"}"#).unwrap();
        let results = SessionResults::from(wire);
        assert_eq!(results.status, SessionStatus::InProgress);
        assert!(results.confidence.is_none());
        assert!(results.audit_images.is_empty());
    }

    #[test]
    fn test_wire_results_carry_images() {
        let json = r#"{
            "status": "SUCCEEDED",
            "confidence": 97.5,
            "reference_image": {"location": {"bucket": "ev", "key": "liveness/s1/ref.jpg"}},
            "audit_images": [{"bytes": "AQID"}]
        }"#;
        let results = SessionResults::from(serde_json::from_str::<WireResults>(json).unwrap());
        assert_eq!(results.status, SessionStatus::Succeeded);
        assert_eq!(results.confidence, Some(97.5));
        assert_eq!(
            results.stored_reference(),
            Some(&ObjectLocation::new("ev", "liveness/s1/ref.jpg"))
        );
        assert_eq!(results.evidence_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_unrecognised_status_is_unknown() {
        let wire: WireResults = serde_json::from_str(r#"{"status":"PAUSED"}"#).unwrap();
        assert_eq!(SessionResults::from(wire).status, SessionStatus::Unknown);
    }

    #[test]
    fn test_create_body_shape() {
        let settings = SessionSettings::default();
        let body = serde_json::to_value(CreateSessionBody { settings: &settings }).unwrap();
        assert_eq!(body["settings"]["audit_images_limit"], 2);
        assert_eq!(body["settings"]["challenge"]["max_retries"], 5);
    }

    #[test]
    fn test_transient_classification() {
        let unavailable = ProviderError::Status {
            status: 503,
            body: String::new(),
        };
        let not_found = ProviderError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(unavailable.is_transient());
        assert!(!not_found.is_transient());
        assert!(!ProviderError::Malformed("x".into()).is_transient());
    }

    #[test]
    fn test_missing_session_id_parses() {
        let created: CreatedSession = serde_json::from_str("{}").unwrap();
        assert!(created.session_id.is_none());
    }
}
