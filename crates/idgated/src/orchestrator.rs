//! Remote liveness session lifecycle: create, poll to completion, resolve
//! the evidence image.

use std::sync::Arc;
use std::time::Duration;

use idgate_core::liveness::{OutputConfig, SessionSettings};
use idgate_core::{LivenessSession, ObjectLocation, ReferenceImageRef, SessionResults};
use thiserror::Error;
use tokio::sync::watch;

use crate::providers::{LivenessProvider, ObjectStorage, ProviderError};

pub const DEFAULT_POLL_ATTEMPTS: u32 = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(400);
pub const EVIDENCE_URL_TTL: Duration = Duration::from_secs(60);
const EVIDENCE_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("provider returned no session id")]
    Creation,
    #[error("liveness provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("polling cancelled")]
    Cancelled,
}

/// Cancellation flag shared between the poller and whoever may abort it.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Sender lives as long as any token clone; unreachable in practice.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub audit_images_limit: u8,
    pub challenge_retries: u32,
    /// Provider writes evidence here itself when set.
    pub evidence_output: Option<OutputConfig>,
    /// Where to upload inline evidence bytes when the provider did not store them.
    pub fallback_output: Option<OutputConfig>,
    pub presign: bool,
    pub url_ttl: Duration,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            audit_images_limit: 2,
            challenge_retries: 5,
            evidence_output: None,
            fallback_output: None,
            presign: true,
            url_ttl: EVIDENCE_URL_TTL,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A finished poll: the session plus the last results read, which carry
/// the images needed for resolution.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub session: LivenessSession,
    pub results: Option<SessionResults>,
}

pub struct SessionOrchestrator {
    provider: Arc<dyn LivenessProvider>,
    storage: Arc<dyn ObjectStorage>,
    config: OrchestratorConfig,
}

impl SessionOrchestrator {
    pub fn new(
        provider: Arc<dyn LivenessProvider>,
        storage: Arc<dyn ObjectStorage>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            storage,
            config,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let mut settings = SessionSettings::default().with_audit_images(self.config.audit_images_limit);
        settings.challenge.max_retries = self.config.challenge_retries;
        settings.output = self.config.evidence_output.clone();
        settings
    }

    pub async fn create_session(&self) -> Result<LivenessSession, SessionError> {
        let created = self.provider.create_session(&self.session_settings()).await?;
        let session_id = created
            .session_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(SessionError::Creation)?;
        tracing::info!(session_id = %session_id, "liveness session created");
        Ok(LivenessSession::new(session_id))
    }

    /// Poll at a fixed interval until the session leaves `IN_PROGRESS` or
    /// `max_attempts` polls have gone by, then make one last query.
    ///
    /// Provider errors are absorbed: transient ones use up a poll, anything
    /// else ends the loop early. A session still unfinished after the last
    /// query comes back as `UNKNOWN`. Only cancellation is an error.
    pub async fn poll_until_terminal(
        &self,
        session_id: &str,
        max_attempts: u32,
        interval: Duration,
        cancel: &CancelToken,
    ) -> Result<PollOutcome, SessionError> {
        let mut session = LivenessSession::new(session_id);
        let mut last = None;

        for attempt in 1..=max_attempts {
            match self.query(session_id, cancel).await? {
                Ok(results) => {
                    session.observe(&results);
                    tracing::debug!(session_id, attempt, status = %results.status, "polled session");
                    last = Some(results);
                    if session.is_terminal() {
                        return Ok(PollOutcome {
                            session,
                            results: last,
                        });
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(session_id, attempt, error = %e, "transient poll error");
                }
                Err(e) => {
                    tracing::warn!(session_id, attempt, error = %e, "poll failed, giving up early");
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        match self.query(session_id, cancel).await? {
            Ok(results) => {
                session.observe(&results);
                last = Some(results);
            }
            Err(e) => tracing::warn!(session_id, error = %e, "final poll failed"),
        }
        if !session.is_terminal() {
            tracing::warn!(session_id, "session did not finish in time");
        }
        session.close_unfinished();
        Ok(PollOutcome {
            session,
            results: last,
        })
    }

    async fn query(
        &self,
        session_id: &str,
        cancel: &CancelToken,
    ) -> Result<Result<SessionResults, ProviderError>, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            r = self.provider.get_session_results(session_id) => Ok(r),
        }
    }

    /// Pick the evidence image, first success wins: the provider's stored
    /// object, inline bytes uploaded to the fallback bucket, inline bytes
    /// as base64, nothing.
    pub async fn resolve_reference_image(
        &self,
        session_id: &str,
        results: Option<&SessionResults>,
    ) -> ReferenceImageRef {
        let Some(results) = results else {
            tracing::warn!(session_id, "no results to resolve evidence from");
            return ReferenceImageRef::None;
        };

        if let Some(location) = results.stored_reference() {
            match self.url_for(location).await {
                Ok(url) => return ReferenceImageRef::RemoteUrl(url),
                Err(e) => tracing::warn!(session_id, %location, error = %e, "stored evidence URL failed"),
            }
        }

        let Some(bytes) = results.evidence_bytes() else {
            tracing::warn!(session_id, "no evidence image available");
            return ReferenceImageRef::None;
        };

        if let Some(dest) = &self.config.fallback_output {
            let location = ObjectLocation::new(
                dest.bucket.clone(),
                format!("{}{session_id}/reference.jpg", dest.key_prefix),
            );
            match self.upload_evidence(&location, bytes).await {
                Ok(url) => return ReferenceImageRef::RemoteUrl(url),
                Err(e) => tracing::warn!(session_id, %location, error = %e, "evidence upload failed"),
            }
        }

        ReferenceImageRef::inline(bytes)
    }

    /// Poll a session to completion and attach its resolved evidence.
    pub async fn complete_session(
        &self,
        session_id: &str,
        cancel: &CancelToken,
    ) -> Result<LivenessSession, SessionError> {
        let outcome = self
            .poll_until_terminal(
                session_id,
                self.config.poll_attempts,
                self.config.poll_interval,
                cancel,
            )
            .await?;
        let mut session = outcome.session;
        let image = self
            .resolve_reference_image(session_id, outcome.results.as_ref())
            .await;
        session.attach_reference(image);
        Ok(session)
    }

    async fn upload_evidence(&self, location: &ObjectLocation, bytes: &[u8]) -> Result<String, ProviderError> {
        self.storage
            .put(location, bytes.to_vec(), EVIDENCE_CONTENT_TYPE)
            .await?;
        self.url_for(location).await
    }

    async fn url_for(&self, location: &ObjectLocation) -> Result<String, ProviderError> {
        if self.config.presign {
            self.storage.retrieval_url(location, self.config.url_ttl).await
        } else {
            Ok(self.storage.public_url(location))
        }
    }
}
