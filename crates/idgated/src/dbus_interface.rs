use std::sync::Arc;

use base64::Engine as _;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::camera::DeviceError;
use crate::capture::CaptureError;
use crate::config::Config;
use crate::service::{ServiceError, ServiceEvent, VerificationService};
use crate::store::{SqliteObjectStore, StoreError};
use crate::uploads::UploadError;

pub const BUS_NAME: &str = "org.idgate.Verify1";
pub const OBJECT_PATH: &str = "/org/idgate/Verify1";

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub service: Arc<VerificationService>,
    pub store: SqliteObjectStore,
}

/// D-Bus interface for the verification daemon.
///
/// Bus name: org.idgate.Verify1
/// Object path: /org/idgate/Verify1
///
/// Structured results are returned as JSON strings. Empty string arguments
/// stand for "not given".
pub struct VerifyInterface {
    pub state: Arc<AppState>,
}

fn optional(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn service_error(op: &str, e: ServiceError) -> zbus::fdo::Error {
    tracing::error!(op, error = %e, "request failed");
    match e {
        ServiceError::Capture(CaptureError::Device(DeviceError::PermissionDenied(_))) => {
            zbus::fdo::Error::AccessDenied(e.to_string())
        }
        ServiceError::Upload(UploadError::Validation(_)) | ServiceError::UnknownSession(_) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    match e {
        StoreError::BadSignature | StoreError::Expired => {
            zbus::fdo::Error::AccessDenied(e.to_string())
        }
        StoreError::BadUrl(_) | StoreError::NotFound(_) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        _ => {
            tracing::error!(error = %e, "object fetch failed");
            zbus::fdo::Error::Failed(e.to_string())
        }
    }
}

/// `None` (reported as `null`) when the store cannot be read, so a broken
/// store does not look like an empty one.
fn object_count(result: Result<u64, StoreError>) -> Option<u64> {
    match result {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "cannot count stored objects");
            None
        }
    }
}

#[interface(name = "org.idgate.Verify1")]
impl VerifyInterface {
    /// Return daemon and run status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.state.service.status().await;
        let objects = object_count(self.state.store.count_all().await);
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera_dir": self.state.config.camera_dir,
            "objects_stored": objects,
            "run": report,
        })
        .to_string())
    }

    /// List usable cameras, best first, as JSON.
    async fn list_devices(&self) -> zbus::fdo::Result<String> {
        let devices = self
            .state
            .service
            .list_devices()
            .await
            .map_err(|e| service_error("list_devices", e))?;
        to_json(&devices)
    }

    /// Open a camera framed for `kind`. Returns the device id in use.
    async fn start_capture(&self, device_id: &str, kind: &str) -> zbus::fdo::Result<String> {
        tracing::info!(device_id, kind, "start_capture requested");
        self.state
            .service
            .start_capture(optional(device_id), optional(kind))
            .await
            .map_err(|e| service_error("start_capture", e))
    }

    async fn switch_camera(&self) -> zbus::fdo::Result<String> {
        let device = self
            .state
            .service
            .switch_camera()
            .await
            .map_err(|e| service_error("switch_camera", e))?;
        to_json(&device)
    }

    /// Take the current accepted frame. The JPEG comes back base64-encoded.
    async fn capture(&self) -> zbus::fdo::Result<String> {
        let image = self
            .state
            .service
            .capture()
            .await
            .map_err(|e| service_error("capture", e))?;
        Ok(serde_json::json!({
            "device_id": image.device_id,
            "width": image.width,
            "height": image.height,
            "bytes": image.jpeg.len(),
            "verdict": image.verdict,
            "jpeg_base64": base64::engine::general_purpose::STANDARD.encode(&image.jpeg),
        })
        .to_string())
    }

    async fn retake(&self) -> zbus::fdo::Result<String> {
        self.state
            .service
            .retake()
            .await
            .map_err(|e| service_error("retake", e))
    }

    async fn stop_capture(&self) -> zbus::fdo::Result<()> {
        self.state
            .service
            .stop_capture()
            .await
            .map_err(|e| service_error("stop_capture", e))
    }

    /// Upload the captured document and attach it to the run.
    async fn confirm_upload(
        &self,
        kind: &str,
        user_id: &str,
        country: &str,
    ) -> zbus::fdo::Result<String> {
        if country.trim().len() != 2 {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "country must be an ISO 3166-1 alpha-2 code, got '{country}'"
            )));
        }
        let receipt = self
            .state
            .service
            .confirm_upload(optional(kind), optional(user_id), &country.trim().to_ascii_uppercase())
            .await
            .map_err(|e| service_error("confirm_upload", e))?;
        to_json(&receipt)
    }

    /// Create a liveness session. Returns its id.
    async fn start_liveness_attempt(&self) -> zbus::fdo::Result<String> {
        self.state
            .service
            .start_liveness_attempt()
            .await
            .map_err(|e| service_error("start_liveness_attempt", e))
    }

    /// Wait for the session to finish and record the attempt.
    async fn complete_liveness_attempt(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let report = self
            .state
            .service
            .complete_liveness_attempt(session_id)
            .await
            .map_err(|e| service_error("complete_liveness_attempt", e))?;
        to_json(&report)
    }

    async fn cancel_liveness_attempt(&self) -> zbus::fdo::Result<bool> {
        self.state
            .service
            .cancel_liveness_attempt()
            .await
            .map_err(|e| service_error("cancel_liveness_attempt", e))
    }

    async fn restart(&self) -> zbus::fdo::Result<()> {
        self.state
            .service
            .restart()
            .await
            .map_err(|e| service_error("restart", e))
    }

    /// Resolve a signed object URL to `(content_type, bytes)`.
    async fn fetch_object(&self, url: &str) -> zbus::fdo::Result<(String, Vec<u8>)> {
        let object = self
            .state
            .store
            .fetch_signed(url, chrono::Utc::now())
            .await
            .map_err(store_error)?;
        tracing::debug!(
            location = %object.location,
            bytes = object.bytes.len(),
            created_at = %object.created_at,
            "object served"
        );
        Ok((object.content_type, object.bytes))
    }

    /// Gate verdict for the latest frame, as JSON.
    #[zbus(signal)]
    async fn frame_verdict(emitter: &SignalEmitter<'_>, update: &str) -> zbus::Result<()>;

    /// A liveness attempt has been resolved, as JSON.
    #[zbus(signal)]
    async fn attempt_resolved(emitter: &SignalEmitter<'_>, report: &str) -> zbus::Result<()>;
}

/// Relay service events as D-Bus signals until the service goes away.
pub async fn forward_signals(conn: zbus::Connection, service: Arc<VerificationService>) {
    let mut events = service.subscribe();
    drop(service);
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot emit signals");
            return;
        }
    };

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "signal relay lagging, dropped events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let result = match &event {
            ServiceEvent::FrameVerdict(update) => match serde_json::to_string(update) {
                Ok(json) => VerifyInterface::frame_verdict(&emitter, &json).await,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot encode frame verdict");
                    continue;
                }
            },
            ServiceEvent::AttemptResolved(report) => match serde_json::to_string(report) {
                Ok(json) => VerifyInterface::attempt_resolved(&emitter, &json).await,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot encode attempt report");
                    continue;
                }
            },
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "signal emission failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_arguments_mean_absent() {
        assert_eq!(optional(""), None);
        assert_eq!(optional("  "), None);
        assert_eq!(optional(" cam-1 "), Some("cam-1".to_string()));
    }

    #[test]
    fn test_validation_errors_are_invalid_args() {
        let e = ServiceError::Upload(UploadError::Validation(
            idgate_core::document::ValidationError::MissingFile,
        ));
        assert!(matches!(service_error("t", e), zbus::fdo::Error::InvalidArgs(_)));

        let e = ServiceError::Capture(CaptureError::Device(DeviceError::PermissionDenied("cam".into())));
        assert!(matches!(service_error("t", e), zbus::fdo::Error::AccessDenied(_)));

        assert!(matches!(
            service_error("t", ServiceError::NothingCaptured),
            zbus::fdo::Error::Failed(_)
        ));
    }

    #[test]
    fn test_unreadable_store_reports_null_count() {
        assert_eq!(object_count(Ok(0)), Some(0));
        assert_eq!(object_count(Err(StoreError::InvalidBlob(3))), None);

        let status = serde_json::json!({ "objects_stored": object_count(Err(StoreError::Expired)) });
        assert!(status["objects_stored"].is_null());
    }

    #[test]
    fn test_store_errors_map_to_access_denied() {
        assert!(matches!(store_error(StoreError::Expired), zbus::fdo::Error::AccessDenied(_)));
        assert!(matches!(
            store_error(StoreError::BadUrl("x".into())),
            zbus::fdo::Error::InvalidArgs(_)
        ));
    }
}
