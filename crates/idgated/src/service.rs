//! The capture-and-verify flow the UI drives: frame gating, document
//! upload, liveness attempts and the state machine behind them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use idgate_core::document::{self, DocumentUpload, DEFAULT_DOCUMENT_KIND};
use idgate_core::verification::TransitionError;
use idgate_core::{
    AttemptOutcome, DeviceDescriptor, DocumentRecord, SessionStatus, VerificationState,
    VerificationStateMachine, VerificationSummary,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::capture::{CaptureError, CaptureHandle, CapturedImage, FrameUpdate};
use crate::orchestrator::{CancelToken, SessionError, SessionOrchestrator};
use crate::uploads::{DocumentUploader, UploadError, UploadReceipt};

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("no captured document to upload")]
    NothingCaptured,
    #[error("a liveness attempt is already in flight")]
    AttemptInFlight,
    #[error("no liveness attempt in flight for session '{0}'")]
    UnknownSession(String),
    #[error("the run was restarted while the document was uploading")]
    RunRestarted,
}

/// How a resolved attempt ended for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Passed,
    Retry,
    Locked,
}

/// Published once per resolved liveness attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptReport {
    pub session_id: String,
    pub session_status: SessionStatus,
    pub confidence: f32,
    pub outcome: OutcomeKind,
    pub state: VerificationState,
    pub attempts_used: u32,
    pub attempts_remaining: u32,
    /// Present once the run is over.
    pub summary: Option<VerificationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    FrameVerdict(FrameUpdate),
    AttemptResolved(AttemptReport),
}

/// Snapshot for `status` callers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: VerificationState,
    pub attempts_used: u32,
    pub attempts_remaining: u32,
    pub max_attempts: u32,
    pub acceptance_threshold: f32,
    pub document: Option<DocumentRecord>,
    pub summary: Option<VerificationSummary>,
    pub capture_generation: u64,
    pub captured_bytes: Option<usize>,
    pub session_in_flight: Option<String>,
}

/// The attempt slot. `session_id` stays empty while the provider is still
/// creating the session.
struct InFlight {
    session_id: Option<String>,
    cancel: CancelToken,
    polling: bool,
}

pub struct VerificationService {
    capture: CaptureHandle,
    orchestrator: SessionOrchestrator,
    uploader: DocumentUploader,
    machine: Mutex<VerificationStateMachine>,
    /// Last still taken, kept until it is uploaded or retaken.
    captured: Mutex<Option<CapturedImage>>,
    /// Document kind the current capture is framed for.
    kind: Mutex<String>,
    attempt: Mutex<Option<InFlight>>,
    /// Bumped by every restart, under the machine lock.
    runs: AtomicU64,
    events: broadcast::Sender<ServiceEvent>,
}

impl VerificationService {
    /// Build the service and start forwarding frame verdicts to subscribers.
    /// Must be called from within a tokio runtime.
    pub fn new(
        capture: CaptureHandle,
        orchestrator: SessionOrchestrator,
        uploader: DocumentUploader,
        machine: VerificationStateMachine,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let service = Arc::new(Self {
            capture,
            orchestrator,
            uploader,
            machine: Mutex::new(machine),
            captured: Mutex::new(None),
            kind: Mutex::new(DEFAULT_DOCUMENT_KIND.to_string()),
            attempt: Mutex::new(None),
            runs: AtomicU64::new(0),
            events,
        });
        spawn_frame_forwarder(service.capture.clone(), service.events.clone());
        service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ServiceError> {
        Ok(self.capture.list_devices().await?)
    }

    /// Open a camera framed for `kind` and start publishing verdicts.
    /// Returns the device in use.
    pub async fn start_capture(
        &self,
        device_id: Option<String>,
        kind: Option<String>,
    ) -> Result<String, ServiceError> {
        let kind = kind
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DOCUMENT_KIND.to_string());
        let aspect = document::guide_aspect(&kind);
        *self.captured.lock().await = None;
        let device = self.capture.start(device_id, aspect).await?;
        tracing::info!(device = %device, kind = %kind, "capture session started");
        *self.kind.lock().await = kind;
        Ok(device)
    }

    pub async fn switch_camera(&self) -> Result<DeviceDescriptor, ServiceError> {
        Ok(self.capture.switch_camera().await?)
    }

    /// Take the current accepted frame. The stream closes afterwards.
    pub async fn capture(&self) -> Result<CapturedImage, ServiceError> {
        let image = self.capture.capture().await?;
        *self.captured.lock().await = Some(image.clone());
        Ok(image)
    }

    /// Drop the last still and reopen the pinned camera.
    pub async fn retake(&self) -> Result<String, ServiceError> {
        let kind = self.kind.lock().await.clone();
        *self.captured.lock().await = None;
        let device = self
            .capture
            .start(None, document::guide_aspect(&kind))
            .await?;
        tracing::info!(device = %device, "retake");
        Ok(device)
    }

    pub async fn stop_capture(&self) -> Result<(), ServiceError> {
        *self.captured.lock().await = None;
        self.capture.stop().await?;
        Ok(())
    }

    /// Upload the captured still and attach it to the run.
    pub async fn confirm_upload(
        &self,
        kind: Option<String>,
        user_id: Option<String>,
        country: &str,
    ) -> Result<UploadReceipt, ServiceError> {
        let run = {
            let machine = self.machine.lock().await;
            if machine.state() != VerificationState::Idle {
                return Err(TransitionError::Invalid {
                    from: machine.state(),
                    event: "attach a document",
                }
                .into());
            }
            self.runs.load(Ordering::SeqCst)
        };

        let image = self
            .captured
            .lock()
            .await
            .take()
            .ok_or(ServiceError::NothingCaptured)?;
        let kind = match kind.filter(|k| !k.trim().is_empty()) {
            Some(kind) => kind,
            None => self.kind.lock().await.clone(),
        };
        let upload = DocumentUpload {
            bytes: image.jpeg.clone(),
            content_type: "image/jpeg".to_string(),
            kind: Some(kind),
            user_id,
        };

        let receipt = match self.uploader.upload(upload).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(error = %e, "document upload failed, keeping capture for retry");
                *self.captured.lock().await = Some(image);
                return Err(e.into());
            }
        };

        // A restart or another attach during the upload leaves this object
        // unreferenced.
        let attached = {
            let mut machine = self.machine.lock().await;
            if self.runs.load(Ordering::SeqCst) != run {
                Err(ServiceError::RunRestarted)
            } else {
                machine
                    .document_captured(receipt.clone().into_record(country))
                    .map_err(ServiceError::from)
            }
        };
        if let Err(e) = attached {
            tracing::warn!(error = %e, key = %receipt.key, "document not attached, discarding upload");
            self.uploader.discard(&receipt).await;
            return Err(e);
        }
        Ok(receipt)
    }

    /// Move to `Verifying` and ask the provider for a session. A refused
    /// session goes back to `Capturing` without using up an attempt.
    ///
    /// The slot is reserved before the provider is asked, so a cancel issued
    /// while the session is being created takes effect at once.
    pub async fn start_liveness_attempt(&self) -> Result<String, ServiceError> {
        let cancel = CancelToken::new();
        {
            let mut slot = self.attempt.lock().await;
            if slot.is_some() {
                return Err(ServiceError::AttemptInFlight);
            }
            self.machine.lock().await.begin_attempt()?;
            *slot = Some(InFlight {
                session_id: None,
                cancel: cancel.clone(),
                polling: false,
            });
        }

        let created = tokio::select! {
            created = self.orchestrator.create_session() => created,
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        };

        let mut slot = self.attempt.lock().await;
        // Whoever cancelled has already emptied the slot and aborted the attempt.
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled.into());
        }
        match created {
            Ok(session) => {
                let session_id = session.session_id().to_string();
                if let Some(inflight) = slot.as_mut() {
                    inflight.session_id = Some(session_id.clone());
                }
                Ok(session_id)
            }
            Err(e) => {
                tracing::error!(error = %e, "liveness session could not be created");
                *slot = None;
                self.machine.lock().await.abort_attempt()?;
                Err(e.into())
            }
        }
    }

    /// Poll the in-flight session to completion and record the attempt.
    pub async fn complete_liveness_attempt(
        &self,
        session_id: &str,
    ) -> Result<AttemptReport, ServiceError> {
        let cancel = {
            let mut slot = self.attempt.lock().await;
            match slot.as_mut() {
                Some(inflight) if inflight.session_id.as_deref() == Some(session_id) => {
                    if inflight.polling {
                        return Err(ServiceError::AttemptInFlight);
                    }
                    inflight.polling = true;
                    inflight.cancel.clone()
                }
                _ => return Err(ServiceError::UnknownSession(session_id.to_string())),
            }
        };

        // A cancelled poll has already been aborted by whoever cancelled it.
        let session = self.orchestrator.complete_session(session_id, &cancel).await?;

        let mut slot = self.attempt.lock().await;
        match slot.as_ref() {
            Some(inflight) if inflight.session_id.as_deref() == Some(session_id) => *slot = None,
            _ => return Err(SessionError::Cancelled.into()),
        }

        let mut machine = self.machine.lock().await;
        let outcome = machine.resolve_attempt(&session)?;
        let kind = match &outcome {
            AttemptOutcome::Passed(_) => OutcomeKind::Passed,
            AttemptOutcome::Retry { .. } => OutcomeKind::Retry,
            AttemptOutcome::Locked(_) => OutcomeKind::Locked,
        };
        let report = AttemptReport {
            session_id: session_id.to_string(),
            session_status: session.status(),
            confidence: session.confidence(),
            outcome: kind,
            state: machine.state(),
            attempts_used: machine.attempts().len() as u32,
            attempts_remaining: machine.attempts_remaining(),
            summary: outcome.summary().cloned(),
        };
        drop(machine);
        drop(slot);

        let _ = self.events.send(ServiceEvent::AttemptResolved(report.clone()));
        Ok(report)
    }

    /// Abandon the in-flight attempt without using it up. Returns whether
    /// there was one.
    pub async fn cancel_liveness_attempt(&self) -> Result<bool, ServiceError> {
        let mut slot = self.attempt.lock().await;
        let Some(inflight) = slot.take() else {
            return Ok(false);
        };
        inflight.cancel.cancel();
        self.machine.lock().await.abort_attempt()?;
        tracing::info!(session_id = ?inflight.session_id, "liveness attempt cancelled");
        Ok(true)
    }

    /// Back to `Idle`: cancel any attempt, close the camera, forget the run.
    pub async fn restart(&self) -> Result<(), ServiceError> {
        if let Some(inflight) = self.attempt.lock().await.take() {
            inflight.cancel.cancel();
        }
        *self.captured.lock().await = None;
        self.capture.stop().await?;
        {
            let mut machine = self.machine.lock().await;
            machine.restart();
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
        tracing::info!("verification run restarted");
        Ok(())
    }

    pub async fn status(&self) -> StatusReport {
        let session_in_flight = self
            .attempt
            .lock()
            .await
            .as_ref()
            .and_then(|a| a.session_id.clone());
        let captured_bytes = self.captured.lock().await.as_ref().map(|c| c.jpeg.len());
        let machine = self.machine.lock().await;
        StatusReport {
            state: machine.state(),
            attempts_used: machine.attempts().len() as u32,
            attempts_remaining: machine.attempts_remaining(),
            max_attempts: machine.policy().max_attempts,
            acceptance_threshold: machine.policy().acceptance_threshold,
            document: machine.document().cloned(),
            summary: machine.summary().cloned(),
            capture_generation: self.capture.generation(),
            captured_bytes,
            session_in_flight,
        }
    }
}

/// Forward verdicts of the running stream, dropping any that belong to a
/// stream that has since been stopped or replaced.
fn spawn_frame_forwarder(capture: CaptureHandle, events: broadcast::Sender<ServiceEvent>) {
    let mut updates = capture.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let update = updates.borrow_and_update().clone();
            let Some(update) = update else {
                continue;
            };
            if update.generation != capture.generation() {
                continue;
            }
            // No subscribers is fine.
            let _ = events.send(ServiceEvent::FrameVerdict(update));
        }
        tracing::debug!("frame forwarder stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use idgate_core::{Facing, VerificationPolicy};

    use crate::camera::tests::{checker, ReplayDir};
    use crate::camera::ReplayCameraBackend;
    use crate::capture::{spawn_capture, CaptureSettings};
    use crate::fakes::{finished, FakeLiveness, FakeStorage};
    use crate::orchestrator::OrchestratorConfig;
    use crate::resolver::CameraDeviceResolver;

    struct Harness {
        _dir: ReplayDir,
        service: Arc<VerificationService>,
        storage: Arc<FakeStorage>,
    }

    fn harness(tag: &str, liveness: FakeLiveness, bucket: Option<&str>) -> Harness {
        let dir = ReplayDir::new(tag);
        dir.device("cam-1", Some("Front Webcam"), &[checker(320, 240, 4)])
            .device("cam-2", Some("Back Camera"), &[checker(320, 240, 4)]);
        let backend = Arc::new(ReplayCameraBackend::new(&dir.root, 200));
        let resolver = CameraDeviceResolver::new(backend, Facing::Front);
        let capture = spawn_capture(resolver, CaptureSettings::default()).unwrap();

        let storage = Arc::new(FakeStorage::default());
        let orchestrator = SessionOrchestrator::new(
            Arc::new(liveness),
            storage.clone(),
            OrchestratorConfig {
                poll_attempts: 3,
                poll_interval: Duration::from_millis(5),
                ..OrchestratorConfig::default()
            },
        );
        let uploader = DocumentUploader::new(
            storage.clone(),
            bucket.map(str::to_string),
            "ids/",
            true,
            Duration::from_secs(90),
        );
        let machine = VerificationStateMachine::new(VerificationPolicy {
            acceptance_threshold: 80.0,
            max_attempts: 2,
        });
        Harness {
            _dir: dir,
            service: VerificationService::new(capture, orchestrator, uploader, machine),
            storage,
        }
    }

    async fn next_accepted(events: &mut broadcast::Receiver<ServiceEvent>) -> FrameUpdate {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(ServiceEvent::FrameVerdict(update)) if update.verdict.accepted => return update,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
        .await
        .unwrap()
    }

    /// Start the camera, wait for an accepted frame, capture and upload.
    async fn attach_document(h: &Harness) {
        let mut events = h.service.subscribe();
        h.service.start_capture(None, None).await.unwrap();
        next_accepted(&mut events).await;
        h.service.capture().await.unwrap();
        h.service
            .confirm_upload(None, Some("u1".into()), "KE")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_capture_and_upload_attaches_document() {
        let h = harness("svc-upload", FakeLiveness::new(Some("s-1")), Some("docs"));
        let mut events = h.service.subscribe();
        let device = h.service.start_capture(None, Some("passport".into())).await.unwrap();
        assert_eq!(device, "cam-1");

        let update = next_accepted(&mut events).await;
        assert_eq!(update.device_id, "cam-1");

        let image = h.service.capture().await.unwrap();
        assert_eq!(h.service.status().await.captured_bytes, Some(image.jpeg.len()));

        let receipt = h
            .service
            .confirm_upload(None, Some("u1".into()), "KE")
            .await
            .unwrap();
        assert_eq!(receipt.kind, "passport");
        assert_eq!(receipt.content_type, "image/jpeg");
        assert!(receipt.key.starts_with("ids/u1/passport/"));
        assert_eq!(h.storage.objects.lock().unwrap().len(), 1);

        let status = h.service.status().await;
        assert_eq!(status.state, VerificationState::Capturing);
        assert_eq!(status.document.unwrap().country, "KE");
        assert_eq!(status.captured_bytes, None);
    }

    #[tokio::test]
    async fn test_upload_without_capture_is_refused() {
        let h = harness("svc-empty", FakeLiveness::new(Some("s-1")), Some("docs"));
        let err = h.service.confirm_upload(None, None, "KE").await.unwrap_err();
        assert!(matches!(err, ServiceError::NothingCaptured));
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_capture() {
        let h = harness("svc-nobucket", FakeLiveness::new(Some("s-1")), None);
        let mut events = h.service.subscribe();
        h.service.start_capture(None, None).await.unwrap();
        next_accepted(&mut events).await;
        h.service.capture().await.unwrap();

        let err = h.service.confirm_upload(None, None, "KE").await.unwrap_err();
        assert!(matches!(err, ServiceError::Upload(UploadError::Configuration)));
        let status = h.service.status().await;
        assert_eq!(status.state, VerificationState::Idle);
        assert!(status.captured_bytes.is_some());
    }

    #[tokio::test]
    async fn test_passing_attempt_publishes_summary() {
        let liveness = FakeLiveness::new(Some("s-1")).then(finished(SessionStatus::Succeeded, 91.0));
        let h = harness("svc-pass", liveness, Some("docs"));
        attach_document(&h).await;

        let mut events = h.service.subscribe();
        let session_id = h.service.start_liveness_attempt().await.unwrap();
        assert_eq!(session_id, "s-1");
        assert_eq!(h.service.status().await.state, VerificationState::Verifying);

        let report = h.service.complete_liveness_attempt(&session_id).await.unwrap();
        assert_eq!(report.outcome, OutcomeKind::Passed);
        assert_eq!(report.state, VerificationState::Success);
        let summary = report.summary.clone().unwrap();
        assert_eq!(summary.attempts.len(), 1);
        assert_eq!(summary.document.country, "KE");

        let published = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ServiceEvent::AttemptResolved(r)) = events.recv().await {
                    return r;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(published, report);
    }

    #[tokio::test]
    async fn test_failures_lock_the_run() {
        let liveness = FakeLiveness::new(Some("s-1")).then(finished(SessionStatus::Succeeded, 40.0));
        let h = harness("svc-lock", liveness, Some("docs"));
        attach_document(&h).await;

        let id = h.service.start_liveness_attempt().await.unwrap();
        let first = h.service.complete_liveness_attempt(&id).await.unwrap();
        assert_eq!(first.outcome, OutcomeKind::Retry);
        assert_eq!(first.attempts_remaining, 1);
        assert!(first.summary.is_none());

        let id = h.service.start_liveness_attempt().await.unwrap();
        let second = h.service.complete_liveness_attempt(&id).await.unwrap();
        assert_eq!(second.outcome, OutcomeKind::Locked);
        assert_eq!(second.state, VerificationState::Locked);
        assert_eq!(second.summary.unwrap().attempts.len(), 2);

        assert!(matches!(
            h.service.start_liveness_attempt().await,
            Err(ServiceError::Transition(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_session_does_not_use_an_attempt() {
        let h = harness("svc-refused", FakeLiveness::new(None), Some("docs"));
        attach_document(&h).await;

        let err = h.service.start_liveness_attempt().await.unwrap_err();
        assert!(matches!(err, ServiceError::Session(SessionError::Creation)));
        let status = h.service.status().await;
        assert_eq!(status.state, VerificationState::Capturing);
        assert_eq!(status.attempts_remaining, 2);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_in_flight() {
        let h = harness("svc-double", FakeLiveness::new(Some("s-1")), Some("docs"));
        attach_document(&h).await;

        h.service.start_liveness_attempt().await.unwrap();
        assert!(matches!(
            h.service.start_liveness_attempt().await,
            Err(ServiceError::AttemptInFlight)
        ));
        assert!(matches!(
            h.service.complete_liveness_attempt("other").await,
            Err(ServiceError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_returns_to_capturing_without_recording() {
        // Never finishes, so completion keeps polling until cancelled.
        let h = harness("svc-cancel", FakeLiveness::new(Some("s-1")), Some("docs"));
        attach_document(&h).await;
        let id = h.service.start_liveness_attempt().await.unwrap();

        let service = Arc::clone(&h.service);
        let completion = tokio::spawn(async move { service.complete_liveness_attempt(&id).await });
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(h.service.cancel_liveness_attempt().await.unwrap());

        assert!(matches!(
            completion.await.unwrap(),
            Err(ServiceError::Session(SessionError::Cancelled))
        ));
        let status = h.service.status().await;
        assert_eq!(status.state, VerificationState::Capturing);
        assert_eq!(status.attempts_used, 0);
        assert!(!h.service.cancel_liveness_attempt().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_session_creation() {
        let liveness = FakeLiveness::new(Some("s-1")).slow_to_create(Duration::from_secs(30));
        let h = harness("svc-cancel-create", liveness, Some("docs"));
        attach_document(&h).await;

        let service = Arc::clone(&h.service);
        let start = tokio::spawn(async move { service.start_liveness_attempt().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            h.service.start_liveness_attempt().await,
            Err(ServiceError::AttemptInFlight)
        ));
        let cancelled = tokio::time::timeout(Duration::from_secs(1), h.service.cancel_liveness_attempt())
            .await
            .expect("cancel blocked behind session creation")
            .unwrap();
        assert!(cancelled);
        assert!(matches!(
            start.await.unwrap(),
            Err(ServiceError::Session(SessionError::Cancelled))
        ));

        let status = h.service.status().await;
        assert_eq!(status.state, VerificationState::Capturing);
        assert_eq!(status.attempts_used, 0);
        assert!(status.session_in_flight.is_none());
    }

    #[tokio::test]
    async fn test_restart_during_upload_discards_document() {
        let h = harness("svc-upload-restart", FakeLiveness::new(Some("s-1")), Some("docs"));
        let mut events = h.service.subscribe();
        h.service.start_capture(None, None).await.unwrap();
        next_accepted(&mut events).await;
        h.service.capture().await.unwrap();
        *h.storage.put_delay.lock().unwrap() = Duration::from_millis(200);

        let service = Arc::clone(&h.service);
        let upload =
            tokio::spawn(async move { service.confirm_upload(None, Some("u1".into()), "KE").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.service.restart().await.unwrap();

        assert!(matches!(upload.await.unwrap(), Err(ServiceError::RunRestarted)));
        assert!(h.storage.objects.lock().unwrap().is_empty());
        let status = h.service.status().await;
        assert_eq!(status.state, VerificationState::Idle);
        assert!(status.document.is_none());
    }

    #[tokio::test]
    async fn test_restart_clears_the_run() {
        let h = harness("svc-restart", FakeLiveness::new(Some("s-1")), Some("docs"));
        attach_document(&h).await;
        h.service.start_liveness_attempt().await.unwrap();

        h.service.restart().await.unwrap();
        let status = h.service.status().await;
        assert_eq!(status.state, VerificationState::Idle);
        assert!(status.document.is_none());
        assert!(status.session_in_flight.is_none());
    }

    #[tokio::test]
    async fn test_retake_reopens_pinned_camera() {
        let h = harness("svc-retake", FakeLiveness::new(Some("s-1")), Some("docs"));
        let mut events = h.service.subscribe();
        h.service.start_capture(Some("cam-2".into()), None).await.unwrap();
        next_accepted(&mut events).await;
        h.service.capture().await.unwrap();

        assert_eq!(h.service.retake().await.unwrap(), "cam-2");
        assert_eq!(h.service.status().await.captured_bytes, None);
        h.service.stop_capture().await.unwrap();
    }
}
