use std::path::PathBuf;
use std::time::Duration;

use idgate_core::gate::{GateConfig, GateConfigError, GateProfile};
use idgate_core::liveness::OutputConfig;
use idgate_core::verification::{DEFAULT_ACCEPTANCE_THRESHOLD, DEFAULT_MAX_ATTEMPTS};
use idgate_core::{Facing, VerificationPolicy};
use serde::Deserialize;
use thiserror::Error;

use crate::capture::CaptureSettings;
use crate::orchestrator::{OrchestratorConfig, EVIDENCE_URL_TTL};

/// Presigned document URLs live a little longer than evidence ones.
pub const DOCUMENT_URL_TTL: Duration = Duration::from_secs(90);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid gate config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Gate(#[from] GateConfigError),
    #[error("{key}: invalid value '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the replay camera tree: one subdirectory per device.
    pub camera_dir: PathBuf,
    pub camera_fps: u32,
    /// Facing preferred when ranking cameras and no device is pinned.
    pub preferred_facing: Facing,
    /// Path to the SQLite object database.
    pub db_path: PathBuf,
    /// Prefix for object URLs handed to clients.
    pub public_url_base: String,
    /// Base URL of the liveness gateway.
    pub liveness_url: String,
    pub liveness_api_key: Option<String>,
    pub provider_timeout_secs: u64,
    /// Bucket for liveness evidence. Unset: evidence is only ever inlined.
    pub evidence_bucket: Option<String>,
    pub evidence_prefix: String,
    pub evidence_presign: bool,
    /// Bucket for uploaded documents. Unset: uploads are refused.
    pub ids_bucket: Option<String>,
    pub ids_prefix: String,
    pub ids_presign: bool,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub acceptance_threshold: f32,
    pub max_attempts: u32,
    pub audit_images: u8,
    pub challenge_retries: u32,
    /// Frame gate thresholds: named profile plus file overrides.
    pub gate: GateConfig,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `IDGATE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("idgate");

        let camera_dir = std::env::var("IDGATE_CAMERA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("cameras"));
        let db_path = std::env::var("IDGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("objects.db"));

        let preferred_facing = match std::env::var("IDGATE_CAMERA_FACING").as_deref() {
            Err(_) | Ok("front") => Facing::Front,
            Ok("back") => Facing::Back,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "IDGATE_CAMERA_FACING",
                    value: other.to_string(),
                })
            }
        };

        let gate_file = match std::env::var("IDGATE_GATE_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Io { path, source })?;
                Some(text)
            }
            Err(_) => None,
        };
        let gate = gate_config_from(
            std::env::var("IDGATE_GATE_PROFILE").ok().as_deref(),
            gate_file.as_deref(),
        )?;

        Ok(Self {
            camera_dir,
            camera_fps: env_u64("IDGATE_CAMERA_FPS", 15).clamp(1, 120) as u32,
            preferred_facing,
            db_path,
            public_url_base: std::env::var("IDGATE_PUBLIC_URL")
                .unwrap_or_else(|_| "idgate://objects".to_string()),
            liveness_url: std::env::var("IDGATE_LIVENESS_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8700/liveness".to_string()),
            liveness_api_key: std::env::var("IDGATE_LIVENESS_API_KEY").ok(),
            provider_timeout_secs: env_u64("IDGATE_PROVIDER_TIMEOUT_SECS", 10),
            evidence_bucket: env_non_empty("IDGATE_EVIDENCE_BUCKET"),
            evidence_prefix: std::env::var("IDGATE_EVIDENCE_PREFIX")
                .unwrap_or_else(|_| "liveness/".to_string()),
            evidence_presign: env_flag("IDGATE_EVIDENCE_PRESIGN", true),
            ids_bucket: env_non_empty("IDGATE_IDS_BUCKET"),
            ids_prefix: std::env::var("IDGATE_IDS_PREFIX").unwrap_or_else(|_| "ids/".to_string()),
            ids_presign: env_flag("IDGATE_IDS_PRESIGN", true),
            poll_attempts: env_u64("IDGATE_POLL_ATTEMPTS", 10) as u32,
            poll_interval_ms: env_u64("IDGATE_POLL_INTERVAL_MS", 400),
            acceptance_threshold: env_f32("IDGATE_ACCEPTANCE_THRESHOLD", DEFAULT_ACCEPTANCE_THRESHOLD),
            max_attempts: (env_u64("IDGATE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS as u64) as u32).max(1),
            audit_images: env_u64("IDGATE_AUDIT_IMAGES", 2).min(u8::MAX as u64) as u8,
            challenge_retries: env_u64("IDGATE_CHALLENGE_RETRIES", 5) as u32,
            gate,
            session_bus: std::env::var("IDGATE_SESSION_BUS").is_ok(),
        })
    }

    /// Evidence destination, shared by the provider output and the
    /// inline-bytes fallback upload.
    pub fn evidence_output(&self) -> Option<OutputConfig> {
        self.evidence_bucket.as_ref().map(|bucket| OutputConfig {
            bucket: bucket.clone(),
            key_prefix: self.evidence_prefix.clone(),
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            audit_images_limit: self.audit_images,
            challenge_retries: self.challenge_retries,
            evidence_output: self.evidence_output(),
            fallback_output: self.evidence_output(),
            presign: self.evidence_presign,
            url_ttl: EVIDENCE_URL_TTL,
            poll_attempts: self.poll_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn verification_policy(&self) -> VerificationPolicy {
        VerificationPolicy {
            acceptance_threshold: self.acceptance_threshold,
            max_attempts: self.max_attempts,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            gate: self.gate,
            ..CaptureSettings::default()
        }
    }
}

/// Individual thresholds layered over a named profile.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GateOverrides {
    profile: Option<String>,
    min_framing_coverage: Option<f32>,
    min_sharpness: Option<f32>,
    max_glare_fraction: Option<f32>,
    min_brightness: Option<f32>,
    max_brightness: Option<f32>,
    ring_thickness_px: Option<u32>,
    inset_ratio: Option<f32>,
}

/// Resolve the gate thresholds. An explicit `profile` beats the file's
/// `profile` key; both default to the baseline profile.
pub fn gate_config_from(profile: Option<&str>, toml_text: Option<&str>) -> Result<GateConfig, ConfigError> {
    let overrides: GateOverrides = match toml_text {
        Some(text) => toml::from_str(text)?,
        None => GateOverrides::default(),
    };

    let profile: GateProfile = match profile.or(overrides.profile.as_deref()) {
        Some(name) => name.parse()?,
        None => GateProfile::Baseline,
    };

    let mut gate = profile.config();
    if let Some(v) = overrides.min_framing_coverage {
        gate.min_framing_coverage = v;
    }
    if let Some(v) = overrides.min_sharpness {
        gate.min_sharpness = v;
    }
    if let Some(v) = overrides.max_glare_fraction {
        gate.max_glare_fraction = v;
    }
    if let Some(v) = overrides.min_brightness {
        gate.min_brightness = v;
    }
    if let Some(v) = overrides.max_brightness {
        gate.max_brightness = v;
    }
    if let Some(v) = overrides.ring_thickness_px {
        gate.ring_thickness_px = Some(v);
    }
    if let Some(v) = overrides.inset_ratio {
        gate.inset_ratio = v;
    }
    gate.validate()?;

    tracing::debug!(?profile, ?gate, "gate thresholds resolved");
    Ok(gate)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_baseline() {
        assert_eq!(gate_config_from(None, None).unwrap(), GateConfig::baseline());
    }

    #[test]
    fn test_named_profile() {
        assert_eq!(gate_config_from(Some("loose"), None).unwrap(), GateConfig::loose());
    }

    #[test]
    fn test_file_overrides_layer_on_profile() {
        let text = r#"
            profile = "loose"
            min_sharpness = 7.5
            ring_thickness_px = 5
        "#;
        let gate = gate_config_from(None, Some(text)).unwrap();
        assert_eq!(gate.min_sharpness, 7.5);
        assert_eq!(gate.ring_thickness_px, Some(5));
        assert_eq!(gate.max_glare_fraction, GateConfig::loose().max_glare_fraction);
    }

    #[test]
    fn test_explicit_profile_beats_file() {
        let gate = gate_config_from(Some("baseline"), Some(r#"profile = "loose""#)).unwrap();
        assert_eq!(gate.min_framing_coverage, GateConfig::baseline().min_framing_coverage);
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            gate_config_from(None, Some("min_sharpnes = 1.0")),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            gate_config_from(None, Some("min_brightness = 0.9\nmax_brightness = 0.1")),
            Err(ConfigError::Gate(_))
        ));
        assert!(matches!(
            gate_config_from(Some("strict"), None),
            Err(ConfigError::Gate(_))
        ));
    }
}
