//! Remote face-liveness session model.
//!
//! A session is created by the liveness provider, the subject completes the
//! challenge in the provider's own client, and the result is then read back
//! by polling. Only the polling side lives in this workspace; these types
//! describe what it sees.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::object::ObjectLocation;

/// Provider-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    InProgress,
    Succeeded,
    Failed,
    Expired,
    Unknown,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::InProgress
    }

    /// Parse a provider status string. `CREATED` is a session nobody has
    /// started yet and is treated as in progress.
    pub fn from_provider(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" | "IN_PROGRESS" => SessionStatus::InProgress,
            "SUCCEEDED" => SessionStatus::Succeeded,
            "FAILED" => SessionStatus::Failed,
            "EXPIRED" => SessionStatus::Expired,
            _ => SessionStatus::Unknown,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Succeeded => "SUCCEEDED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    FaceMovement,
    FaceMovementAndLight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePolicy {
    pub kind: ChallengeKind,
    pub max_retries: u32,
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        Self {
            kind: ChallengeKind::FaceMovement,
            max_retries: 5,
        }
    }
}

/// Where the provider should write evidence images itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub bucket: String,
    pub key_prefix: String,
}

/// Upper bound on audit images a provider will return per session.
pub const MAX_AUDIT_IMAGES: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub audit_images_limit: u8,
    pub challenge: ChallengePolicy,
    pub output: Option<OutputConfig>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            audit_images_limit: 2,
            challenge: ChallengePolicy::default(),
            output: None,
        }
    }
}

impl SessionSettings {
    pub fn with_audit_images(mut self, limit: u8) -> Self {
        self.audit_images_limit = limit.min(MAX_AUDIT_IMAGES);
        self
    }
}

/// An image as the provider returns it: a stored object, inline bytes, or
/// both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderImage {
    pub location: Option<ObjectLocation>,
    #[serde(default, with = "opt_base64")]
    pub bytes: Option<Vec<u8>>,
}

/// One read of a session's results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResults {
    pub status: SessionStatus,
    pub confidence: Option<f32>,
    pub reference_image: Option<ProviderImage>,
    #[serde(default)]
    pub audit_images: Vec<ProviderImage>,
}

impl SessionResults {
    pub fn in_progress() -> Self {
        Self {
            status: SessionStatus::InProgress,
            confidence: None,
            reference_image: None,
            audit_images: Vec::new(),
        }
    }

    /// The reference image's stored object, if the provider wrote one.
    pub fn stored_reference(&self) -> Option<&ObjectLocation> {
        self.reference_image
            .as_ref()
            .and_then(|img| img.location.as_ref())
            .filter(|loc| loc.is_complete())
    }

    /// Raw evidence bytes: the reference image, else the first audit image.
    pub fn evidence_bytes(&self) -> Option<&[u8]> {
        let primary = self
            .reference_image
            .as_ref()
            .and_then(|img| img.bytes.as_deref())
            .filter(|b| !b.is_empty());
        primary.or_else(|| {
            self.audit_images
                .first()
                .and_then(|img| img.bytes.as_deref())
                .filter(|b| !b.is_empty())
        })
    }
}

/// Resolved evidence image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReferenceImageRef {
    RemoteUrl(String),
    InlineBytesBase64(String),
    None,
}

impl ReferenceImageRef {
    pub fn inline(bytes: &[u8]) -> Self {
        ReferenceImageRef::InlineBytesBase64(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ReferenceImageRef::None)
    }

    /// Something a browser can put in an `<img src>`.
    pub fn display_src(&self) -> Option<String> {
        match self {
            ReferenceImageRef::RemoteUrl(url) => Some(url.clone()),
            ReferenceImageRef::InlineBytesBase64(b64) => Some(format!("data:image/jpeg;base64,{b64}")),
            ReferenceImageRef::None => None,
        }
    }
}

/// A liveness session as tracked locally.
///
/// Status only moves forward: once terminal, later observations are ignored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessSession {
    session_id: String,
    status: SessionStatus,
    confidence: f32,
    reference_image: Option<ReferenceImageRef>,
}

impl LivenessSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::InProgress,
            confidence: 0.0,
            reference_image: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn reference_image(&self) -> Option<&ReferenceImageRef> {
        self.reference_image.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold one poll result in. Returns false if the session was already
    /// terminal and the observation was dropped.
    pub fn observe(&mut self, results: &SessionResults) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = results.status;
        self.confidence = results.confidence.unwrap_or(0.0).clamp(0.0, 100.0);
        true
    }

    /// Close a session the provider never finished: still in progress
    /// becomes `Unknown`.
    pub fn close_unfinished(&mut self) {
        if self.status == SessionStatus::InProgress {
            self.status = SessionStatus::Unknown;
        }
    }

    pub fn attach_reference(&mut self, image: ReferenceImageRef) {
        self.reference_image = Some(image);
    }
}

mod opt_base64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&base64::engine::general_purpose::STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
